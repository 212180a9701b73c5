use crate::http::types::Version;
use std::{error, fmt, io};

/// Failure produced while parsing a single HTTP/1.x message.
///
/// `TooSmall` is deliberately absent here — a resumable parse stage that
/// runs out of bytes returns [`ParseOutcome::NeedMore`](crate::http::parser::ParseOutcome::NeedMore)
/// instead of an error, since it isn't a failure at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidMethod,
    InvalidUri,
    UriTooLarge,
    InvalidProtocol,
    InvalidHeader,
    TooManyHeaders,
    HeaderTooLarge,
    InvalidContentLength,
    TooLarge,
    NotImplemented,
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ParseError {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        InvalidUri: "400 Bad Request", "51"
            => r#"{"error":"Invalid request URI","code":"INVALID_URI"}"#;
        UriTooLarge: "414 URI Too Long", "53"
            => r#"{"error":"Request URI too large","code":"URI_TOO_LARGE"}"#;
        InvalidProtocol: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP protocol","code":"INVALID_PROTOCOL"}"#;
        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeaderTooLarge: "431 Request Header Fields Too Large", "58"
            => r#"{"error":"Request header too large","code":"HEADER_TOO_LARGE"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        TooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        NotImplemented: "501 Not Implemented", "62"
            => r#"{"error":"Transfer encoding not supported","code":"NOT_IMPLEMENTED"}"#;
    }

    /// Whether the engine sends an error response before closing, per the
    /// driver-action table: most parse failures close silently, but the
    /// four "too large"/"too many" kinds get a status line first.
    #[inline(always)]
    pub(crate) const fn sends_response(&self) -> bool {
        matches!(
            self,
            Self::UriTooLarge | Self::TooManyHeaders | Self::HeaderTooLarge | Self::TooLarge
        )
    }
}

/// The fixed 408 response sent when a connection's idle/read timeout fires
/// mid-request. Not a [`ParseError`] variant since it isn't something the
/// parser itself produces — the connection driver raises it when `recv()`
/// times out.
pub(crate) const fn request_timeout_response(version: Version, json: bool) -> &'static [u8] {
    match (json, version) {
        (true, Version::Http11) => concat!(
            "HTTP/1.1 408 Request Timeout\r\n",
            "connection: close\r\n",
            "content-length: 54\r\n",
            "content-type: application/json\r\n",
            "\r\n",
            r#"{"error":"Request timed out","code":"REQUEST_TIMEOUT"}"#
        )
        .as_bytes(),
        (false, Version::Http11) => {
            b"HTTP/1.1 408 Request Timeout\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        }
        (true, Version::Http10) => concat!(
            "HTTP/1.0 408 Request Timeout\r\n",
            "connection: close\r\n",
            "content-length: 54\r\n",
            "content-type: application/json\r\n",
            "\r\n",
            r#"{"error":"Request timed out","code":"REQUEST_TIMEOUT"}"#
        )
        .as_bytes(),
        (false, Version::Http10) => {
            b"HTTP/1.0 408 Request Timeout\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        }
    }
}

impl error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failure in server setup or the accept loop, distinct from per-request
/// [`ParseError`]s: these never reach a connection driver and are always
/// propagated to whoever called [`Server::launch`](crate::Server::launch)
/// or [`Tcp::connect`](crate::tcp::Tcp::connect).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),

    #[error("accept() failed: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to connect after {attempts} attempt(s)")]
    Connect { attempts: usize },

    #[error("connect() timed out before any candidate address accepted")]
    ConnectTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_includes_code() {
        let body = ParseError::InvalidMethod.as_http(Version::Http11, true);
        let body = std::str::from_utf8(body).unwrap();
        assert!(body.contains("INVALID_METHOD"));
        assert!(body.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn non_json_error_has_empty_body() {
        let body = ParseError::TooLarge.as_http(Version::Http10, false);
        let body = std::str::from_utf8(body).unwrap();
        assert!(body.ends_with("content-length: 0\r\n\r\n"));
        assert!(body.starts_with("HTTP/1.0 413 Payload Too Large\r\n"));
    }

    #[test]
    fn request_timeout_response_is_well_formed() {
        let body = request_timeout_response(Version::Http11, true);
        let body = std::str::from_utf8(body).unwrap();
        assert!(body.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        assert!(body.contains("REQUEST_TIMEOUT"));

        let body = request_timeout_response(Version::Http10, false);
        let body = std::str::from_utf8(body).unwrap();
        assert!(body.starts_with("HTTP/1.0 408 Request Timeout\r\n"));
        assert!(body.ends_with("content-length: 0\r\n\r\n"));
    }

    #[test]
    fn sends_response_matches_driver_action_table() {
        assert!(ParseError::UriTooLarge.sends_response());
        assert!(ParseError::TooManyHeaders.sends_response());
        assert!(ParseError::HeaderTooLarge.sends_response());
        assert!(ParseError::TooLarge.sends_response());

        assert!(!ParseError::InvalidMethod.sends_response());
        assert!(!ParseError::InvalidUri.sends_response());
        assert!(!ParseError::InvalidProtocol.sends_response());
        assert!(!ParseError::InvalidHeader.sends_response());
        assert!(!ParseError::InvalidContentLength.sends_response());
        assert!(!ParseError::NotImplemented.sends_response());
    }
}
