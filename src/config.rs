//! Server configuration: connection, request, and response limits
//!
//! # Security-first defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Memory consumption
//!
//! Each active connection consumes memory according to:
//!
//! `Total` = [`Request Buffer`](crate::config::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::config::RespLimits#buffer-management) +
//!           `Runtime Overhead`
//!
//! # Examples
//!
//! ```no_run
//! # runloop_http::impt_default_handler!{MyHandler}
//! use runloop_http::{Server, config::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency ceiling
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             client_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 200,     // More headers for complex APIs
//!             body_size: 16 * 1024,  // 16KB for larger payloads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls the accept loop's concurrency ceiling and error-response format.
///
/// The accept loop parks once `max_connections` connections are live and
/// resumes exactly once per connection that finishes, rather than queueing
/// accepted sockets for a worker pool to pick up — see
/// [`Server::launch`](crate::Server::launch).
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrently live connections (default: `1024`).
    ///
    /// Enforced by a semaphore sized to this value: the accept loop does not
    /// call `accept()` again until a permit is free.
    pub max_connections: usize,

    /// Format for error responses emitted by the engine before the user
    /// callback runs (default: `true`).
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Connection-level timeouts and lifetime limits.
///
/// Controls individual TCP connection behavior including timeouts,
/// lifetime, and request limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Deadline for the first request on a freshly accepted connection
    /// (default: `60 seconds`).
    ///
    /// If no complete request arrives within this time, the connection is
    /// sent a `408 Request Timeout` and closed. Prevents slowloris-style
    /// stalls.
    pub client_timeout: Duration,

    /// Deadline for requests after the first one on a keep-alive connection
    /// (default: `0`, meaning "use [`client_timeout`](Self::client_timeout)").
    pub keep_alive_timeout: Duration,

    /// Whether a connection may be reused for more than one request
    /// (default: `true`).
    ///
    /// When `false`, every connection closes after its first response
    /// regardless of the request's `Connection` header.
    pub keep_alive_enabled: bool,

    /// Maximum duration to wait for writing a response to the socket
    /// (default: `3 seconds`).
    pub socket_write_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`).
    ///
    /// Connection closes after processing this many requests. Helps bound
    /// long-lived connections independent of timeouts.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a connection from acceptance to closure
    /// (default: `2 minutes`).
    ///
    /// Final safety net, in case business logic keeps a connection alive
    /// well past what its timeouts alone would allow.
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(0),
            keep_alive_enabled: true,
            socket_write_timeout: Duration::from_secs(3),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,

            _priv: (),
        }
    }
}

impl ConnLimits {
    /// Returns the timeout to arm for the Nth request on a connection
    /// (`request_count` is the number of requests already completed).
    #[inline(always)]
    pub(crate) fn timeout_for(&self, request_count: usize) -> Duration {
        if request_count == 0 || self.keep_alive_timeout.is_zero() {
            self.client_timeout
        } else {
            self.keep_alive_timeout
        }
    }
}

/// HTTP request parsing limits and buffer pre-allocation strategy.
///
/// # Security-first defaults
///
/// These limits are intentionally conservative to prevent resource
/// exhaustion and various parsing attacks. They work well for:
/// - Simple REST APIs
/// - Microservices
/// - Internal tools
/// - Low-memory environments
///
/// You may need to increase these if you see:
/// - `413 Content Too Large` for legitimate requests
/// - `414 URI Too Large` for normal API calls
/// - `431 Request Header Fields Too Large`
///
/// # Memory allocation strategy
///
/// Each connection's parser buffer grows on demand (see
/// [`Parser`](crate::http::parser::Parser)) but is pre-reserved to roughly:
///
/// ```text
/// Total Buffer = First Line + (Headers x Header Line) + Body + Overhead
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum URI length in bytes, including the query string
    /// (default: `256 B`).
    pub url_size: usize,

    /// Maximum number of headers per request (default: `100`).
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`).
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `2048 B`, exclusive
    /// per spec: values of exactly 2048 bytes or more are rejected).
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `4 KB`).
    pub body_size: usize,

    /// Pre-body header-bytes ceiling (default: `8192 B`).
    ///
    /// Bytes read before a request's headers are fully parsed are counted
    /// against this ceiling per connection; exceeding it closes the
    /// connection regardless of any other limit.
    pub header_read_ceiling: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 256,
            header_count: 100,
            header_name_size: 64,
            header_value_size: 2048,
            body_size: 4 * 1024,
            header_read_ceiling: 8192,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the estimated memory buffer size the parser will typically
    /// grow to for a connection using these limits.
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();

        self
    }

    #[inline(always)]
    // First line + Header * N + "\r\n" + Body
    fn buffer(&self) -> usize {
        self.precalc.first_line + self.header_count * self.precalc.h_line + 2 + self.body_size
    }

    #[inline(always)]
    // GET /url/test HTTP/1.1\r\n
    // |-| |-------| |------|
    // Method  URI    Version
    //
    // Formula: Method(7) + " " + URI + " " + Version(8) + "\r\n"
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Authorization: Sample Data\r\n
    // |-----------|  |-----------|
    //      Name           Value
    //
    // Formula: Name + ": " + Value + "\r\n"
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) h_line: usize,
}

/// Configuration for response processing and memory allocation limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`).
    pub default_capacity: usize,
    /// Maximum buffer capacity retained between requests; larger buffers
    /// are freed and reallocated at `default_capacity` (default: `8192 B`).
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_limits_defaults() {
        let limits = ServerLimits::default();
        assert_eq!(limits.max_connections, 1024);
        assert!(limits.json_errors);
    }

    #[test]
    fn conn_limits_timeout_for() {
        let mut limits = ConnLimits::default();
        assert_eq!(limits.timeout_for(0), limits.client_timeout);
        assert_eq!(limits.timeout_for(1), limits.client_timeout);

        limits.keep_alive_timeout = Duration::from_secs(5);
        assert_eq!(limits.timeout_for(0), limits.client_timeout);
        assert_eq!(limits.timeout_for(1), Duration::from_secs(5));
    }

    #[test]
    fn req_limits_precalculate() {
        let limits = ReqLimits::default().precalculate();
        assert_eq!(limits.precalc.first_line, 19 + 256);
        assert_eq!(limits.precalc.h_line, 64 + 2048 + 4);
        assert_eq!(
            limits.precalc.buffer,
            limits.precalc.first_line + 100 * limits.precalc.h_line + 2 + 4096
        );
    }
}
