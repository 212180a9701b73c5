//! Raw TCP host/connect primitive, parallel to the HTTP accept loop in
//! [`crate::server::accept`] but with no parsing: a [`TcpHandler`] gets
//! `open`/`data`/`close` callbacks over raw bytes instead of a [`Request`]/
//! [`Response`] pair.

use crate::{
    errors::ServerError,
    server::{control::Control, write_queue::WriteQueue},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncReadExt,
    net::{lookup_host, TcpListener, TcpStream},
    sync::Semaphore,
    time::timeout,
};

/// Enqueues bytes on a connection's write queue, handed to [`TcpHandler`]
/// callbacks so they can reply to the peer that triggered them.
#[derive(Clone)]
pub struct TcpWriter(Arc<WriteQueue>);

impl TcpWriter {
    /// Appends `bytes` to the connection's outbound queue. Never blocks;
    /// if the connection has already closed, the message is dropped.
    #[inline]
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        self.0.enqueue(bytes.into());
    }
}

/// Callbacks for a raw TCP connection, invoked for every byte chunk read
/// off the socket rather than a parsed request.
pub trait TcpHandler: Sync + Send + 'static {
    /// Called once a connection is accepted (server) or established
    /// (client), before any data arrives. `writer` can be used to send
    /// unsolicited bytes (a greeting banner, for instance).
    fn open(&self, peer: SocketAddr, writer: &TcpWriter) -> impl Future<Output = ()> + Send {
        async move {
            let _ = (peer, writer);
        }
    }

    /// Called for every chunk of bytes `recv` returns. `writer` lets the
    /// handler reply on the same connection.
    fn data(&self, peer: SocketAddr, bytes: &[u8], writer: &TcpWriter) -> impl Future<Output = ()> + Send;

    /// Called once the connection closes, for any reason. There is nothing
    /// left to write to by this point, so no writer is passed.
    fn close(&self, peer: SocketAddr) -> impl Future<Output = ()> + Send {
        async move {
            let _ = peer;
        }
    }
}

/// Limits for a [`TcpServer`].
#[derive(Debug, Clone)]
pub struct TcpLimits {
    /// Maximum number of concurrently live connections (default: `512`).
    pub max_connections: usize,
    /// Maximum bytes read per `recv()` call (default: `8192`).
    pub max_data_read: usize,
    /// Deadline for a single write on a connection's socket before the
    /// connection is treated as dead (default: `3 seconds`), matching
    /// [`ConnLimits::socket_write_timeout`](crate::config::ConnLimits::socket_write_timeout).
    pub write_timeout: Duration,
}

impl Default for TcpLimits {
    fn default() -> Self {
        Self {
            max_connections: 512,
            max_data_read: 8192,
            write_timeout: Duration::from_secs(3),
        }
    }
}

/// Binds a listening socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// supported) optionally set, and the OS backlog clamped to `[0, 128]`.
pub async fn bind(addr: SocketAddr, backlog: u32, reuse_address: bool) -> Result<TcpListener, ServerError> {
    let backlog = backlog.min(128);
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(ServerError::Bind)?;

    if reuse_address {
        socket.set_reuse_address(true).map_err(ServerError::Bind)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(ServerError::Bind)?;
    }

    socket.set_nonblocking(true).map_err(ServerError::Bind)?;
    socket.bind(&addr.into()).map_err(ServerError::Bind)?;
    socket.listen(backlog as i32).map_err(ServerError::Bind)?;

    TcpListener::from_std(socket.into()).map_err(ServerError::Bind)
}

/// Resolves `host:port`, trying each candidate address in turn; moves to the
/// next candidate only on `ConnectionRefused`, matching the multi-candidate
/// retry behavior of the reference `connect()`. Any other error aborts
/// immediately. The whole resolve-and-dial sequence is bounded by
/// [`DEFAULT_CONNECT_TIMEOUT`].
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, ServerError> {
    timeout(DEFAULT_CONNECT_TIMEOUT, connect_inner(host, port))
        .await
        .unwrap_or(Err(ServerError::ConnectTimeout))
}

async fn connect_inner(host: &str, port: u16) -> Result<TcpStream, ServerError> {
    let candidates = lookup_host((host, port)).await.map_err(ServerError::Accept)?;
    let mut attempts = 0;

    for addr in candidates {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
            Err(e) => return Err(ServerError::Accept(e)),
        }
    }

    Err(ServerError::Connect { attempts })
}

/// A TCP server driving one [`TcpHandler`] read loop per accepted socket.
pub struct TcpServer<H: TcpHandler> {
    listener: TcpListener,
    handler: Arc<H>,
    semaphore: Arc<Semaphore>,
    control: Arc<Control>,
    limits: TcpLimits,
}

impl<H: TcpHandler> TcpServer<H> {
    /// Wraps an already-bound listener (see [`bind`]) with the given
    /// handler and limits.
    pub fn new(listener: TcpListener, handler: H, limits: TcpLimits) -> Self {
        let semaphore = Arc::new(Semaphore::new(limits.max_connections));
        Self {
            listener,
            handler: Arc::new(handler),
            semaphore,
            control: Control::new(),
            limits,
        }
    }

    /// Returns a cloneable handle that can [`stop`](TcpServerHandle::stop)
    /// this server from outside the task running [`launch`](Self::launch).
    #[inline]
    pub fn handle(&self) -> TcpServerHandle {
        TcpServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Accepts connections until [`TcpServerHandle::stop`] is called,
    /// spawning one read-loop task per connection, gated by
    /// `max_connections`. Stopping closes the listening socket and
    /// eagerly aborts every connection task still registered.
    pub async fn launch(self) {
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let (stream, peer) = tokio::select! {
                biased;
                _ = self.control.wait_for_stop() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept() failed");
                        drop(permit);
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self.handler);
            let max_data_read = self.limits.max_data_read;
            let write_timeout = self.limits.write_timeout;

            let join = tokio::spawn(async move {
                let _permit = permit;
                run_read_loop(stream, peer, handler, max_data_read, write_timeout).await;
            });
            self.control.register(join.abort_handle());
        }
    }
}

/// Cloneable handle for stopping a [`TcpServer`] and inspecting its live
/// connection count from outside the task running [`TcpServer::launch`].
#[derive(Clone)]
pub struct TcpServerHandle {
    control: Arc<Control>,
}

impl TcpServerHandle {
    /// Idempotent. Closes the listening socket (by waking the accept loop
    /// out of `launch`) and aborts every connection task still registered.
    #[inline]
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Number of connection tasks currently registered.
    #[inline]
    pub fn live_connections(&self) -> usize {
        self.control.live_connections()
    }
}

/// Drives one TCP connection's `open`/`data`/`close` lifecycle. Shared by
/// both the server side (via [`TcpServer::launch`]) and a client connection
/// established through [`connect`], per the "client has a read loop
/// identical to the server-side connection loop but without a registry"
/// design note.
pub async fn run_read_loop<H: TcpHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    max_data_read: usize,
    write_timeout: Duration,
) {
    let (mut read_half, write_half) = stream.into_split();
    let queue = Arc::new(WriteQueue::spawn(write_half, write_timeout));
    let writer = TcpWriter(Arc::clone(&queue));

    handler.open(peer, &writer).await;

    let mut buf = vec![0u8; max_data_read];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => handler.data(peer, &buf[..n], &writer).await,
            Err(e) if is_closed_socket_error(&e) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "tcp read error");
                break;
            }
        }
    }

    queue.wait_for_drain().await;
    handler.close(peer).await;
}

#[inline(always)]
fn is_closed_socket_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Caps how long a client-side [`connect`] call may block resolving and
/// dialing candidates before giving up, independent of any per-socket OS
/// timeout. Unused by the server path.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    struct Echo {
        received: Arc<AtomicUsize>,
    }

    impl TcpHandler for Echo {
        async fn data(&self, _peer: SocketAddr, bytes: &[u8], _writer: &TcpWriter) {
            self.received.fetch_add(bytes.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn read_loop_counts_bytes_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(Echo {
            received: Arc::clone(&received),
        });

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_read_loop(stream, peer, handler, 1024, Duration::from_secs(1)).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        drop(client);

        server.await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn connect_reaches_a_listening_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = connect("127.0.0.1", addr.port()).await.unwrap();
        let (_server_stream, _peer) = accept.await.unwrap();

        assert!(client.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn connect_times_out_against_an_unroutable_address() {
        // TEST-NET-1 (RFC 5737), reserved for documentation: routers drop
        // it rather than reject it, so connect() has to hit the timeout
        // branch instead of ConnectionRefused.
        let result = timeout(
            Duration::from_millis(200),
            super::connect_inner("192.0.2.1", 80),
        )
        .await;
        assert!(result.is_err(), "connect_inner should still be pending");
    }

    struct Pong {
        closes: Arc<AtomicUsize>,
    }

    impl TcpHandler for Pong {
        async fn data(&self, _peer: SocketAddr, bytes: &[u8], writer: &TcpWriter) {
            writer.send(bytes.to_vec());
        }

        async fn close(&self, _peer: SocketAddr) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ping_pong_two_clients_one_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        let handler = Pong {
            closes: Arc::clone(&closes),
        };

        let server: TcpServer<Pong> = TcpServer::new(listener, handler, TcpLimits::default());
        let handle = server.handle();
        let launched = tokio::spawn(server.launch());

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        let mut c2 = TcpStream::connect(addr).await.unwrap();

        c1.write_all(b"ping-one").await.unwrap();
        c2.write_all(b"ping-two").await.unwrap();

        let mut r1 = [0u8; 8];
        let mut r2 = [0u8; 8];
        c1.read_exact(&mut r1).await.unwrap();
        c2.read_exact(&mut r2).await.unwrap();
        assert_eq!(&r1, b"ping-one");
        assert_eq!(&r2, b"ping-two");

        drop(c1);
        drop(c2);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        handle.stop();
        launched.await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
