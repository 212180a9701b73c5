//! Accept loop and server construction.
//!
//! The reference keeps an admission queue: every accepted socket is pushed
//! onto a shared queue and picked up by one of a fixed pool of worker tasks,
//! with a separate pool of "alarmist" tasks answering `503` once the queue
//! backs up. This crate drops the queue entirely: [`Server::launch`] gates
//! `accept()` itself behind a [`Semaphore`](tokio::sync::Semaphore) sized to
//! [`ServerLimits::max_connections`] and spawns exactly one task per accepted
//! connection, which is both simpler and avoids holding a live `TcpStream`
//! in a queue while it waits for a worker.

use crate::{
    config::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{
        connection::{ConnectionData, ConnectionFilter, HttpConnection},
        control::Control,
    },
    Response,
};
use std::{
    future::Future,
    marker::PhantomData,
    net::SocketAddr,
    sync::Arc,
};
use tokio::{net::TcpListener, sync::Semaphore};

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. database connection pool, router configuration)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use runloop_http::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
///         if req.uri() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics will terminate the connection.
    fn handle(
        &self,
        connection_data: &mut S,
        request: &crate::Request,
        response: &mut Response,
    ) -> impl Future<Output = crate::Handled> + Send;
}

/// An HTTP server that accepts connections and drives one [`HttpConnection`]
/// per socket, subject to a live-connection ceiling.
///
/// # Examples
///
/// ```no_run
/// use runloop_http::{Server, Handler, Request, Response, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: TcpListener,
    handler: Arc<H>,
    filter: Arc<F>,
    _marker: PhantomData<S>,

    semaphore: Arc<Semaphore>,
    control: Arc<Control>,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl<H, S, F> Server<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder<H, S, ()>
    where
        H: Handler<S>,
        S: ConnectionData,
    {
        ServerBuilder {
            listener: None,
            handler: None,
            connection_filter: Arc::new(()),
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
        }
    }

    /// Returns a cloneable handle that can [`stop`](ServerHandle::stop) this
    /// server from outside the task running [`launch`](Self::launch).
    #[inline]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// Runs until [`ServerHandle::stop`] is called, which closes the
    /// listening socket and aborts every connection task still running.
    pub async fn launch(self) {
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let (stream, client_addr) = tokio::select! {
                biased;
                _ = self.control.wait_for_stop() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept() failed");
                        drop(permit);
                        continue;
                    }
                },
            };
            let Ok(server_addr) = stream.local_addr() else {
                drop(permit);
                continue;
            };

            let handler = Arc::clone(&self.handler);
            let filter = Arc::clone(&self.filter);
            let server_limits = self.server_limits.clone();
            let conn_limits = self.conn_limits.clone();
            let req_limits = self.req_limits.clone();
            let resp_limits = self.resp_limits.clone();

            let join = tokio::spawn(async move {
                let _permit = permit;
                let mut response = Response::new(&resp_limits);

                if filter.filter(client_addr, server_addr, &mut response).is_err() {
                    send_rejection(stream, response).await;
                    return;
                }
                if filter
                    .filter_async(client_addr, server_addr, &mut response)
                    .await
                    .is_err()
                {
                    send_rejection(stream, response).await;
                    return;
                }

                let mut conn = HttpConnection::<H, S>::new(
                    handler,
                    server_limits,
                    conn_limits,
                    req_limits,
                    resp_limits,
                );
                conn.run(stream, client_addr, server_addr).await;
            });
            self.control.register(join.abort_handle());
        }
    }
}

/// Cloneable handle for stopping a [`Server`] and inspecting its live
/// connection count from outside the task running [`Server::launch`].
#[derive(Clone)]
pub struct ServerHandle {
    control: Arc<Control>,
}

impl ServerHandle {
    /// Idempotent. Closes the listening socket (by waking the accept loop
    /// out of `launch`) and aborts every connection task still registered.
    #[inline]
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Number of connection tasks currently registered. Best-effort: a
    /// connection that has just finished may still be counted until the
    /// next registration sweeps it out.
    #[inline]
    pub fn live_connections(&self) -> usize {
        self.control.live_connections()
    }
}

/// Writes a [`ConnectionFilter`] rejection response and drops the socket.
/// Short-lived, so it writes directly rather than standing up a
/// [`WriteQueue`](crate::server::write_queue::WriteQueue) for one message.
async fn send_rejection(mut stream: tokio::net::TcpStream, response: Response) {
    use tokio::io::AsyncWriteExt;
    let _ = stream.write_all(response.buffer()).await;
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    connection_filter: Arc<F>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
}

impl<H, S, F> ServerBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a connection filter to check incoming TCP connections
    /// before using it.
    ///
    /// Allows early rejection of unwanted addresses before the first read.
    /// See [`ConnectionFilter`](crate::ConnectionFilter).
    #[inline(always)]
    pub fn conn_filter<NewF>(self, filter: NewF) -> ServerBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            connection_filter: Arc::new(filter),
            _marker: self._marker,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
        }
    }

    /// Configures the accept loop's concurrency ceiling and error format.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection timeouts and lifetime limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffer limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics if [`listener`](Self::listener) or [`handler`](Self::handler)
    /// was never called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<H, S, F> {
        let listener = self
            .listener
            .expect("The `listener` method must be called to create");
        let handler = self
            .handler
            .expect("The `handler` method must be called to create");

        let server_limits = self.server_limits.unwrap_or_default();
        let semaphore = Arc::new(Semaphore::new(server_limits.max_connections));

        Server {
            listener,
            handler,
            filter: self.connection_filter,
            _marker: PhantomData,

            semaphore,
            control: Control::new(),
            server_limits,
            conn_limits: self.connection_limits.unwrap_or_default(),
            req_limits: self.request_limits.unwrap_or_default().precalculate(),
            resp_limits: self.response_limits.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::def_handler::DefHandler;

    #[tokio::test]
    async fn build_requires_listener_and_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server: Server<DefHandler> = Server::<DefHandler, (), ()>::builder()
            .listener(listener)
            .handler(DefHandler)
            .build();

        assert_eq!(server.server_limits.max_connections, 1024);
    }

    #[tokio::test]
    #[should_panic(expected = "listener")]
    async fn build_panics_without_listener() {
        let _server: Server<DefHandler> = Server::<DefHandler, (), ()>::builder().handler(DefHandler).build();
    }

    #[tokio::test]
    async fn stop_closes_the_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server: Server<DefHandler> = Server::<DefHandler, (), ()>::builder()
            .listener(listener)
            .handler(DefHandler)
            .build();

        let handle = server.handle();
        let launched = tokio::spawn(server.launch());

        handle.stop();
        handle.stop();
        launched.await.unwrap();
    }

    #[tokio::test]
    async fn stop_aborts_live_connections() {
        use tokio::{io::AsyncWriteExt, net::TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server: Server<DefHandler> = Server::<DefHandler, (), ()>::builder()
            .listener(listener)
            .handler(DefHandler)
            .build();

        let handle = server.handle();
        let launched = tokio::spawn(server.launch());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.stop();
        launched.await.unwrap();
        assert_eq!(handle.live_connections(), 0);
    }
}
