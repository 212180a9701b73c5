//! Parsed HTTP request types.
//!
//! [`PendingRequest`] is the per-connection, owned scratch space the
//! connection driver advances one resumable stage at a time (see
//! [`crate::http::parser`]). Once every stage has produced a value,
//! [`PendingRequest::as_request`] borrows the parser's buffer for exactly
//! the duration of the user callback and hands out a [`Request`].

use crate::config::ReqLimits;
use crate::errors::ParseError;
use crate::http::parser::{can_keep_alive, ParseOutcome, Parser};
use crate::http::types::{HeaderMap, Method, Version};

/// A fully parsed request, borrowed from the connection's read buffer for
/// the lifetime of a single handler call.
#[derive(Debug)]
pub struct Request<'p> {
    method: Method,
    uri: &'p [u8],
    version: Version,
    headers: &'p HeaderMap,
    buf: &'p [u8],
    body: Option<&'p [u8]>,
}

impl<'p> Request<'p> {
    /// The request method.
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The raw request target, including any query string. `*` for
    /// `OPTIONS * HTTP/1.1`.
    #[inline(always)]
    pub const fn uri(&self) -> &[u8] {
        self.uri
    }

    /// The protocol version on the request line.
    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Looks up a header value by name, case-insensitively.
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(self.buf, name)
    }

    /// The parsed `Content-Length`, if the request carried one.
    #[inline(always)]
    pub fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// The request body, if one was present.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    /// Whether the connection that produced this request may be reused for
    /// another one, per the keep-alive formula: headers were present, the
    /// protocol is HTTP/1.1, and `Connection` is absent or not `close`.
    #[inline(always)]
    pub(crate) fn can_keep_alive(&self) -> bool {
        can_keep_alive(self.buf, self.headers, self.version)
    }
}

/// Owned, resumable scratch space for a single in-flight request.
///
/// Each field starts `None` and is filled in exactly once as the connection
/// driver calls the matching [`Parser`] stage; a stage already holding
/// `Some` is skipped on the next call into [`PendingRequest::advance`],
/// which is what lets a request span many `recv()`s without re-parsing
/// anything it already committed to.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    method: Option<Method>,
    uri: Option<(usize, usize)>,
    version: Option<Version>,
    headers: HeaderMap,
    headers_done: bool,
    body: Option<Option<(usize, usize)>>,
}

/// What the driver should do after one [`PendingRequest::advance`] call.
pub(crate) enum Advance {
    /// Every stage is complete; the request is ready to hand to the user.
    Ready,
    /// A stage ran out of bytes; `recv()` more and call `advance` again.
    NeedMore,
    /// A stage failed; close (and possibly respond) per the error kind.
    Failed(ParseError),
}

impl PendingRequest {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: HeaderMap::new(limits.header_count),
            headers_done: false,
            body: None,
        }
    }

    /// Clears every field, including headers and any parsed body — a
    /// deliberate departure from treating `headers`/`body` as surviving a
    /// reset, since a stale header from a prior request leaking into the
    /// next one on the same connection would be a correctness bug, not an
    /// optimization.
    pub(crate) fn reset(&mut self) {
        self.method = None;
        self.uri = None;
        self.version = None;
        self.headers.reset();
        self.headers_done = false;
        self.body = None;
    }

    /// The protocol version parsed so far, if the request line has been
    /// fully read. Used by the connection driver to pick a version for a
    /// timeout response raised mid-parse, before a [`Request`] exists.
    #[inline(always)]
    pub(crate) fn version(&self) -> Option<Version> {
        self.version
    }

    #[inline(always)]
    pub(crate) fn is_ready(&self) -> bool {
        self.method.is_some()
            && self.uri.is_some()
            && self.version.is_some()
            && self.headers_done
            && self.body.is_some()
    }

    /// Drives every still-unsatisfied stage forward by one step against
    /// `parser`. Only stages that haven't produced a value yet are called,
    /// per the "resume, don't restart" contract.
    pub(crate) fn advance(&mut self, parser: &mut Parser, limits: &ReqLimits) -> Advance {
        if self.method.is_none() {
            match parser.parse_method() {
                ParseOutcome::Done(m) => self.method = Some(m),
                ParseOutcome::NeedMore => return Advance::NeedMore,
                ParseOutcome::Failed(e) => return Advance::Failed(e),
            }
        }

        if self.uri.is_none() {
            match parser.parse_uri(limits.url_size) {
                ParseOutcome::Done(range) => self.uri = Some(range),
                ParseOutcome::NeedMore => return Advance::NeedMore,
                ParseOutcome::Failed(e) => return Advance::Failed(e),
            }
        }

        if self.version.is_none() {
            match parser.parse_protocol() {
                ParseOutcome::Done(v) => self.version = Some(v),
                ParseOutcome::NeedMore => return Advance::NeedMore,
                ParseOutcome::Failed(e) => return Advance::Failed(e),
            }
        }

        if !self.headers_done {
            match parser.parse_headers(&mut self.headers, limits) {
                ParseOutcome::Done(()) => self.headers_done = true,
                ParseOutcome::NeedMore => return Advance::NeedMore,
                ParseOutcome::Failed(e) => return Advance::Failed(e),
            }
        }

        if self.body.is_none() {
            let skip_body = self.method == Some(Method::Get);
            if skip_body {
                self.body = Some(None);
            } else {
                match parser.parse_body(&mut self.headers, limits) {
                    ParseOutcome::Done(range) => self.body = Some(range),
                    ParseOutcome::NeedMore => return Advance::NeedMore,
                    ParseOutcome::Failed(e) => return Advance::Failed(e),
                }
            }
        }

        Advance::Ready
    }

    /// Borrows `buf` to materialize the finished request. Panics if called
    /// before [`PendingRequest::is_ready`] — an internal driver invariant,
    /// not a condition a caller outside this crate can hit.
    pub(crate) fn as_request<'p>(&'p self, buf: &'p [u8]) -> Request<'p> {
        let (us, ue) = self.uri.expect("request not fully parsed");
        let body_range = self.body.flatten();

        Request {
            method: self.method.expect("request not fully parsed"),
            uri: &buf[us..ue],
            version: self.version.expect("request not fully parsed"),
            headers: &self.headers,
            buf,
            body: body_range.map(|(s, e)| &buf[s..e]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ReqLimits {
        ReqLimits::default().precalculate()
    }

    fn drive(input: &[u8]) -> (Parser, PendingRequest) {
        let limits = limits();
        let mut parser = Parser::new(&limits);
        let mut pending = PendingRequest::new(&limits);

        parser.feed_test(input);

        loop {
            match pending.advance(&mut parser, &limits) {
                Advance::Ready => break,
                Advance::NeedMore => panic!("unexpected NeedMore for: {input:?}"),
                Advance::Failed(e) => panic!("unexpected failure {e:?} for: {input:?}"),
            }
        }

        (parser, pending)
    }

    #[test]
    fn get_request_has_no_body() {
        let (parser, pending) = drive(b"GET /a HTTP/1.1\r\nhost: x\r\n\r\n");
        let req = pending.as_request(parser.buffer());

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.uri(), b"/a");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header(b"Host"), Some(&b"x"[..]));
        assert_eq!(req.body(), None);
        assert!(req.can_keep_alive());
    }

    #[test]
    fn post_request_with_body() {
        let (parser, pending) = drive(b"POST /a HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello");
        let req = pending.as_request(parser.buffer());

        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.body(), Some(&b"hello"[..]));
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let (parser, pending) = drive(b"GET /a HTTP/1.1\r\nconnection: close\r\n\r\n");
        let req = pending.as_request(parser.buffer());
        assert!(!req.can_keep_alive());
    }

    #[test]
    fn http10_never_keeps_alive() {
        let (parser, pending) = drive(b"GET /a HTTP/1.0\r\nhost: x\r\n\r\n");
        let req = pending.as_request(parser.buffer());
        assert!(!req.can_keep_alive());
    }

    #[test]
    fn reset_clears_headers_and_body() {
        let limits = limits();
        let mut pending = PendingRequest::new(&limits);
        pending.method = Some(Method::Get);
        pending.headers.content_length = Some(3);
        pending.headers_done = true;
        pending.body = Some(Some((0, 3)));

        pending.reset();

        assert!(pending.method.is_none());
        assert!(!pending.headers_done);
        assert!(pending.body.is_none());
        assert_eq!(pending.headers.content_length, None);
    }

    #[test]
    fn advance_resumes_across_partial_feeds() {
        let limits = limits();
        let mut parser = Parser::new(&limits);
        let mut pending = PendingRequest::new(&limits);

        parser.feed_test(b"GET /a HTTP/1.1\r\nhost");
        assert!(matches!(
            pending.advance(&mut parser, &limits),
            Advance::NeedMore
        ));
        assert_eq!(pending.method, Some(Method::Get));
        assert_eq!(pending.uri, Some((4, 6)));
        assert_eq!(pending.version, Some(Version::Http11));

        parser.feed_test(b": x\r\n\r\n");
        assert!(matches!(
            pending.advance(&mut parser, &limits),
            Advance::Ready
        ));
        let req = pending.as_request(parser.buffer());
        assert_eq!(req.header(b"host"), Some(&b"x"[..]));
    }
}
