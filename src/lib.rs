//! runloop_http - a resumable HTTP/1.x engine for cooperative async runtimes
//!
//! A from-scratch HTTP/1.0 and HTTP/1.1 server core: wire parsing, a
//! per-connection request/response driver, and a minimal accept loop, built
//! around the idea that every parse stage can be suspended mid-message and
//! resumed on the next `recv()` without re-scanning anything it already
//! committed to.
//!
//! # Protocol support
//!
//! - **HTTP/1.1**: persistent connections, keep-alive
//! - **HTTP/1.0**: basic protocol support, connection closes by default
//!
//! Chunked transfer-encoding on input is rejected with `501 Not Implemented`;
//! there is no HTTP/0.9 support.
//!
//! # Features
//!
//! - **Built-in limits** on URI size, header count/size, and body size,
//!   enforced before the user callback ever runs.
//! - **Custom connection filtering** - implement [`ConnectionFilter`] to
//!   reject unwanted connections before the first read.
//! - **Storing data between requests** - implement [`ConnectionData`] to
//!   keep per-connection state across a keep-alive session.
//! - **A raw TCP primitive** ([`tcp`]) for non-HTTP protocols that still
//!   want the same accept-loop backpressure and read-loop shape.
//!
//! # Quick start
//!
//! ```no_run
//! use runloop_http::{Server, Handler, Request, Response, Handled, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod parser;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod accept;
    pub(crate) mod connection;
    pub(crate) mod control;
    pub(crate) mod write_queue;
}
pub mod config;
pub mod tcp;
pub(crate) mod errors;

pub use crate::{
    errors::ServerError,
    http::{
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Version},
    },
    server::{
        accept::{Handler, Server, ServerBuilder, ServerHandle},
        connection::{ConnectionData, ConnectionFilter},
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    let limits = crate::config::ReqLimits::default().precalculate();
    let mut parser = crate::http::parser::Parser::new(&limits);
    let mut pending = crate::http::request::PendingRequest::new(&limits);

    parser.feed_test(b"GET / HTTP/1.1\r\n\r\n");
    loop {
        match pending.advance(&mut parser, &limits) {
            crate::http::request::Advance::Ready => break,
            crate::http::request::Advance::NeedMore => {
                panic!("run_test: fixture request was incomplete")
            }
            crate::http::request::Advance::Failed(e) => {
                panic!("run_test: fixture request failed to parse: {e:?}")
            }
        }
    }

    let request = pending.as_request(parser.buffer());
    let mut response = Response::new(&crate::config::RespLimits::default());
    f(&request, &mut response);
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use runloop_http::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler<()> for $name {
            async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[cfg(test)]
mod integration {
    use crate::{
        config::{ConnLimits, ReqLimits, ServerLimits},
        Handled, Handler, Request, Response, Server, StatusCode,
    };
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    struct EchoHandler;

    impl Handler<()> for EchoHandler {
        async fn handle(&self, _: &mut (), req: &Request<'_>, resp: &mut Response) -> Handled {
            if req.uri() == b"/x" {
                resp.status(StatusCode::Ok).body("hello")
            } else {
                resp.status(StatusCode::NotFound).body("")
            }
        }
    }

    async fn read_response(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            tokio::select! {
                r = stream.read(&mut chunk) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() > 64 {
                            // give a slow local loopback a moment to flush the rest, then stop
                        }
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(200)) => break,
            }
        }
        buf
    }

    async fn spawn_echo_server(req_limits: ReqLimits) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server: Server<EchoHandler> = Server::<EchoHandler, (), ()>::builder()
            .listener(listener)
            .handler(EchoHandler)
            .server_limits(ServerLimits::default())
            .connection_limits(ConnLimits::default())
            .request_limits(req_limits)
            .build();
        tokio::spawn(server.launch());
        addr
    }

    #[tokio::test]
    async fn echo_200() {
        let addr = spawn_echo_server(ReqLimits::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("content-length: 5\r\n"), "{text}");
        assert!(text.ends_with("hello"), "{text}");
    }

    #[tokio::test]
    async fn keep_alive_reuse() {
        let addr = spawn_echo_server(ReqLimits::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let first = read_response(&mut client).await;
        assert!(String::from_utf8_lossy(&first).starts_with("HTTP/1.1 200 OK\r\n"));

        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: a\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let second = read_response(&mut client).await;
        assert!(String::from_utf8_lossy(&second).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn uri_too_large_closes_connection() {
        let addr = spawn_echo_server(ReqLimits::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut request = b"GET /".to_vec();
        request.extend(std::iter::repeat(b'a').take(300));
        request.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        client.write_all(&request).await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 414 "), "{text}");

        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn too_many_headers_closes_connection() {
        let addr = spawn_echo_server(ReqLimits::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut request = b"GET /x HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            request.extend_from_slice(format!("x-h{i}: 1\r\n").as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        client.write_all(&request).await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 431 "), "{text}");
    }

    #[tokio::test]
    async fn body_too_large_closes_connection() {
        let limits = ReqLimits {
            body_size: 8,
            ..ReqLimits::default()
        };
        let addr = spawn_echo_server(limits).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut request = b"POST /x HTTP/1.1\r\nContent-Length: 100\r\n\r\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(100));
        client.write_all(&request).await.unwrap();

        let response = read_response(&mut client).await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 413 "), "{text}");
    }
}
