//! Per-connection request/response driver.
//!
//! [`HttpConnection::run`] owns one accepted socket end to end: it arms a
//! timeout for the next request, reads into the shared [`Parser`], advances
//! [`PendingRequest`] one stage at a time until a request is ready or the
//! connection has to close, hands the request to the [`Handler`], and
//! enqueues the response on a [`WriteQueue`] before deciding whether to loop
//! for another request or stop.

use crate::{
    config::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    errors::request_timeout_response,
    http::{
        parser::Parser,
        request::{Advance, PendingRequest},
        response::Response,
        types::Version,
    },
    server::{accept::Handler, write_queue::WriteQueue},
    Handled,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Instant};
use tokio::net::TcpStream;

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    pending: PendingRequest,
    parser: Parser,
    response: Response,

    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,

    created: Instant,
    request_count: usize,
    header_bytes_read: usize,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(
        handler: Arc<H>,
        server_limits: ServerLimits,
        conn_limits: ConnLimits,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
    ) -> Self {
        Self {
            handler,
            connection_data: S::new(),

            pending: PendingRequest::new(&req_limits),
            parser: Parser::new(&req_limits),
            response: Response::new(&resp_limits),

            server_limits,
            conn_limits,
            req_limits,
            resp_limits,

            created: Instant::now(),
            request_count: 0,
            header_bytes_read: 0,
        }
    }

    /// Drives one accepted connection to completion: one request per loop
    /// iteration, per the contract in [`crate::server::connection`]'s module
    /// doc. Never returns an error — every failure is either answered with
    /// a fixed status line or ends the connection silently, matching "no
    /// error propagates above the per-connection driver" from the error
    /// handling design.
    pub(crate) async fn run(
        &mut self,
        stream: TcpStream,
        client_addr: SocketAddr,
        _server_addr: SocketAddr,
    ) {
        let (mut read_half, write_half) = stream.into_split();
        let queue = WriteQueue::spawn(write_half, self.conn_limits.socket_write_timeout);

        loop {
            if self.created.elapsed() > self.conn_limits.connection_lifetime {
                tracing::debug!(%client_addr, "connection lifetime exceeded");
                break;
            }
            if self.request_count >= self.conn_limits.max_requests_per_connection {
                tracing::debug!(%client_addr, "max requests per connection reached");
                break;
            }

            match self.run_one_request(&mut read_half, &queue, client_addr).await {
                Outcome::Continue => continue,
                Outcome::Close => break,
            }
        }

        queue.wait_for_drain().await;
    }

    async fn run_one_request(
        &mut self,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        queue: &WriteQueue,
        client_addr: SocketAddr,
    ) -> Outcome {
        let timeout = self.conn_limits.timeout_for(self.request_count);

        loop {
            if self.header_bytes_read >= self.req_limits.header_read_ceiling {
                tracing::debug!(%client_addr, "pre-body header ceiling exceeded");
                return Outcome::Close;
            }

            match self.parser.recv(read_half, timeout, 8192).await {
                Ok(0) => return Outcome::Close,
                Ok(n) => self.header_bytes_read += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    let version = self.pending.version().unwrap_or(Version::Http11);
                    queue.enqueue(
                        request_timeout_response(version, self.server_limits.json_errors).to_vec(),
                    );
                    return Outcome::Close;
                }
                Err(e) if is_closed_socket_error(&e) => return Outcome::Close,
                Err(e) => {
                    tracing::warn!(%client_addr, error = %e, "unexpected read error");
                    return Outcome::Close;
                }
            }

            match self.pending.advance(&mut self.parser, &self.req_limits) {
                Advance::NeedMore => continue,
                Advance::Failed(err) => {
                    if err.sends_response() {
                        queue.enqueue(err.as_http(Version::Http11, self.server_limits.json_errors).to_vec());
                    }
                    return Outcome::Close;
                }
                Advance::Ready => break,
            }
        }

        self.header_bytes_read = 0;
        self.dispatch(queue).await
    }

    async fn dispatch(&mut self, queue: &WriteQueue) -> Outcome {
        let request = self.pending.as_request(self.parser.buffer());
        let version = request.version();
        let keep_alive = request.can_keep_alive() && self.conn_limits.keep_alive_enabled;

        self.response.version = version;
        self.response.keep_alive = keep_alive;

        let _handled: Handled = self.handler.handle(&mut self.connection_data, &request, &mut self.response).await;

        queue.enqueue(self.response.buffer().clone());
        let keep_alive = self.response.keep_alive;

        self.pending.reset();
        self.parser.reset();
        self.response.reset(&self.resp_limits);
        self.request_count += 1;

        if keep_alive {
            Outcome::Continue
        } else {
            Outcome::Close
        }
    }
}

enum Outcome {
    Continue,
    Close,
}

/// Matches the closed-socket error set named in the socket adapter contract:
/// a member of this set means further I/O on the handle is impossible, and
/// the driver loop exits silently rather than logging it as unexpected.
#[inline(always)]
fn is_closed_socket_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use runloop_http::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear();
///     }
/// }
/// ```
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once per connection slot at server startup, which
    /// avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// Called after the connection closes, so the instance can be reused
    /// for the connection that replaces it.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use runloop_http::{ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be
    /// deferred to [`filter_async`](Self::filter_async).
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection, run after [`filter`](Self::filter)
    /// succeeds.
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}
