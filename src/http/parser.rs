//! Resumable byte-level scanner for a single HTTP/1.x message.
//!
//! Unlike [`request::Parser`](super::request), which the teacher's fixed
//! `Box<[u8]>` buffer and an `unsafe` `'static` transmute were built
//! around, this parser owns a plain growing [`Vec<u8>`] plus a `pos`
//! cursor. A stage that runs out of bytes returns [`ParseOutcome::NeedMore`]
//! without moving `pos` — the next [`Parser::recv`] call appends more bytes
//! at the tail and the same stage is simply called again. There is no
//! separate "leftover" buffer: the unconsumed suffix of `buf` already plays
//! that role.
//!
//! [`Parser::reset`] drains the consumed prefix (`0..pos`) rather than
//! zeroing a fixed-size buffer, which is what lets a pipelined request that
//! arrived behind the current one survive into the next message.

use crate::config::ReqLimits;
use crate::errors::ParseError;
use crate::http::types::{to_lower_case, Header, HeaderMap, Method, Version};
use memchr::memchr;
use std::{io, time::Duration};
use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, time::sleep};

/// Outcome of a single resumable parse stage.
///
/// Distinct from [`ParseError`]: running out of bytes mid-message isn't a
/// failure, it's a request for more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseOutcome<T> {
    Done(T),
    NeedMore,
    Failed(ParseError),
}

impl<T> ParseOutcome<T> {
    #[cfg(test)]
    pub(crate) fn unwrap(self) -> T {
        match self {
            ParseOutcome::Done(v) => v,
            ParseOutcome::NeedMore => panic!("called unwrap on NeedMore"),
            ParseOutcome::Failed(e) => panic!("called unwrap on Failed({e:?})"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Parser {
    buf: Vec<u8>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            buf: Vec::with_capacity(limits.precalc.buffer),
            pos: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf
    }

    #[inline(always)]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub(crate) fn unparsed_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Appends bytes directly without going through a socket, standing in
    /// for [`Parser::recv`] when driving the parser against a fixed byte
    /// string — tests, and the doc-example fixture in [`crate::run_test`].
    pub(crate) fn feed_test(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discards the consumed prefix, preserving any pipelined bytes already
    /// sitting past `pos`.
    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.buf.drain(0..self.pos);
        self.pos = 0;
    }

    /// Reads up to `chunk` more bytes from the connection's read half into
    /// the buffer, or times out. Returns `Ok(0)` on a clean EOF.
    pub(crate) async fn recv(
        &mut self,
        reader: &mut OwnedReadHalf,
        timeout: Duration,
        chunk: usize,
    ) -> Result<usize, io::Error> {
        let start = self.buf.len();
        self.buf.resize(start + chunk, 0);

        let result = tokio::select! {
            biased;
            read_result = reader.read(&mut self.buf[start..start + chunk]) => read_result,
            _ = sleep(timeout) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        };

        match result {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    // --- Parse first line -------------------------------------------------

    /// Dispatches the fixed-width method tag at `pos`.
    pub(crate) fn parse_method(&mut self) -> ParseOutcome<Method> {
        let buf = &self.buf[self.pos..];
        if buf.len() < 4 {
            return ParseOutcome::NeedMore;
        }

        match &buf[..4] {
            b"GET " => self.finish_method(Method::Get, 4),
            b"PUT " => self.finish_method(Method::Put, 4),
            b"POST" => self.method_tail(Method::Post, 4, b" ", 5),
            b"HEAD" => self.method_tail(Method::Head, 4, b" ", 5),
            b"PATC" => self.method_tail(Method::Patch, 4, b"H ", 6),
            b"DELE" => self.method_tail(Method::Delete, 3, b"ETE ", 7),
            b"OPTI" => self.method_tail(Method::Options, 4, b"ONS ", 8),
            _ => ParseOutcome::Failed(ParseError::InvalidMethod),
        }
    }

    #[inline(always)]
    fn finish_method(&mut self, method: Method, advance: usize) -> ParseOutcome<Method> {
        self.pos += advance;
        ParseOutcome::Done(method)
    }

    #[inline(always)]
    fn method_tail(
        &mut self,
        method: Method,
        tail_offset: usize,
        tail: &[u8],
        advance: usize,
    ) -> ParseOutcome<Method> {
        let buf = &self.buf[self.pos..];
        if buf.len() < tail_offset + tail.len() {
            return ParseOutcome::NeedMore;
        }
        if &buf[tail_offset..tail_offset + tail.len()] == tail {
            self.finish_method(method, advance)
        } else {
            ParseOutcome::Failed(ParseError::InvalidMethod)
        }
    }

    /// Scans the request target, bounded by `max_uri_size`.
    ///
    /// Returns the `(start, end)` byte range of the URI within
    /// [`Parser::buffer`], exclusive of the trailing space.
    pub(crate) fn parse_uri(&mut self, max_uri_size: usize) -> ParseOutcome<(usize, usize)> {
        let base = self.pos;
        let buf = &self.buf[base..];

        match buf.first() {
            None => ParseOutcome::NeedMore,
            Some(b'*') => match buf.get(1) {
                None => ParseOutcome::NeedMore,
                Some(b' ') => {
                    self.pos += 2;
                    ParseOutcome::Done((base, base + 1))
                }
                Some(_) => ParseOutcome::Failed(ParseError::InvalidUri),
            },
            Some(b'/') => {
                let search_end = buf.len().min(max_uri_size + 1);
                match memchr(b' ', &buf[..search_end]) {
                    Some(idx) => {
                        if buf[..idx].iter().any(|&b| !(0x20..=0x7E).contains(&b)) {
                            return ParseOutcome::Failed(ParseError::InvalidUri);
                        }
                        self.pos += idx + 1;
                        ParseOutcome::Done((base, base + idx))
                    }
                    None if buf.len() > max_uri_size => {
                        ParseOutcome::Failed(ParseError::UriTooLarge)
                    }
                    None => ParseOutcome::NeedMore,
                }
            }
            Some(_) => ParseOutcome::Failed(ParseError::InvalidUri),
        }
    }

    /// Parses the fixed `HTTP/1.x\r\n` protocol tag.
    pub(crate) fn parse_protocol(&mut self) -> ParseOutcome<Version> {
        let buf = &self.buf[self.pos..];
        if buf.len() < 10 {
            return ParseOutcome::NeedMore;
        }

        let version = match Version::from_bytes(&buf[0..8]) {
            Ok(v) => v,
            Err(e) => return ParseOutcome::Failed(e),
        };

        if &buf[8..10] != b"\r\n" {
            return ParseOutcome::Failed(ParseError::InvalidProtocol);
        }

        self.pos += 10;
        ParseOutcome::Done(version)
    }

    // --- Parse headers ------------------------------------------------------

    /// Parses header lines until the blank line that ends the section, bounded
    /// by `limits.header_count`/`header_name_size`/`header_value_size`.
    ///
    /// A later header with the same name (case-insensitively) overwrites the
    /// value recorded for an earlier one, matching HTTP's "last wins" rule.
    pub(crate) fn parse_headers(
        &mut self,
        headers: &mut HeaderMap,
        limits: &ReqLimits,
    ) -> ParseOutcome<()> {
        loop {
            let buf = &self.buf[self.pos..];
            if buf.len() >= 2 && &buf[..2] == b"\r\n" {
                self.pos += 2;
                return ParseOutcome::Done(());
            }
            if buf.len() < 2 {
                return ParseOutcome::NeedMore;
            }

            if headers.headers.len() >= limits.header_count {
                return ParseOutcome::Failed(ParseError::TooManyHeaders);
            }

            match self.parse_header_line(headers, limits) {
                ParseOutcome::Done(()) => continue,
                other => return other,
            }
        }
    }

    fn parse_header_line(
        &mut self,
        headers: &mut HeaderMap,
        limits: &ReqLimits,
    ) -> ParseOutcome<()> {
        match scan_header_line(&self.buf[self.pos..], limits) {
            HeaderLine::Done {
                name,
                value,
                consumed,
            } => {
                let name = (self.pos + name.0, self.pos + name.1);
                let value = (self.pos + value.0, self.pos + value.1);
                to_lower_case(&mut self.buf[name.0..name.1]);

                if let Some(existing) = headers
                    .headers
                    .iter_mut()
                    .find(|h| self.buf[h.name.0..h.name.1] == self.buf[name.0..name.1])
                {
                    existing.value = value;
                } else {
                    headers.headers.push(Header::new(name, value));
                }

                self.pos += consumed;
                ParseOutcome::Done(())
            }
            HeaderLine::NeedMore => ParseOutcome::NeedMore,
            HeaderLine::Failed(e) => ParseOutcome::Failed(e),
        }
    }

    // --- Parse body -----------------------------------------------------

    /// Resolves the request body, if any, against `Content-Length`.
    ///
    /// No headers at all means no body. `Transfer-Encoding: chunked` is
    /// recognized but not implemented. Returns the `(start, end)` byte
    /// range of the body within [`Parser::buffer`]; callers must copy it
    /// out before the next [`Parser::reset`] drains the buffer.
    pub(crate) fn parse_body(
        &mut self,
        headers: &mut HeaderMap,
        limits: &ReqLimits,
    ) -> ParseOutcome<Option<(usize, usize)>> {
        if headers.headers.is_empty() {
            return ParseOutcome::Done(None);
        }

        if let Some(te) = headers.get(&self.buf, b"transfer-encoding") {
            if te.eq_ignore_ascii_case(b"chunked") {
                return ParseOutcome::Failed(ParseError::NotImplemented);
            }
        }

        if headers.content_length.is_none() {
            if let Some(raw) = headers.get(&self.buf, b"content-length") {
                match crate::http::types::slice_to_usize(raw) {
                    Some(n) => headers.content_length = Some(n),
                    None => return ParseOutcome::Failed(ParseError::InvalidContentLength),
                }
            }
        }

        let Some(len) = headers.content_length else {
            return ParseOutcome::Done(None);
        };

        if len > limits.body_size {
            return ParseOutcome::Failed(ParseError::TooLarge);
        }

        if self.unparsed_len() < len {
            return ParseOutcome::NeedMore;
        }

        let start = self.pos;
        self.pos += len;
        ParseOutcome::Done(Some((start, start + len)))
    }
}

/// `headers exist AND (connection absent OR != "close") AND protocol == HTTP/1.1`
pub(crate) fn can_keep_alive(buf: &[u8], headers: &HeaderMap, version: Version) -> bool {
    if headers.headers.is_empty() || version != Version::Http11 {
        return false;
    }
    match headers.get(buf, b"connection") {
        Some(v) => !v.eq_ignore_ascii_case(b"close"),
        None => true,
    }
}

#[inline(always)]
fn is_header_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

#[inline(always)]
fn is_header_value_byte(b: u8) -> bool {
    b == b'\t' || (0x20..=0x7E).contains(&b)
}

enum HeaderLine {
    Done {
        name: (usize, usize),
        value: (usize, usize),
        consumed: usize,
    },
    NeedMore,
    Failed(ParseError),
}

enum Crlf {
    Found(usize),
    NeedMore,
    Invalid,
}

/// Looks for a `\r\n` pair within `buf`, treating a bare `\n` as malformed.
fn scan_to_crlf(buf: &[u8]) -> Crlf {
    match memchr(b'\r', buf) {
        Some(idx) => match buf.get(idx + 1) {
            Some(b'\n') => Crlf::Found(idx),
            Some(_) => Crlf::Invalid,
            None => Crlf::NeedMore,
        },
        None if memchr(b'\n', buf).is_some() => Crlf::Invalid,
        None => Crlf::NeedMore,
    }
}

/// Scans a single `name: value\r\n` line relative to `buf[0..]`.
fn scan_header_line(buf: &[u8], limits: &ReqLimits) -> HeaderLine {
    let name_search_end = buf.len().min(limits.header_name_size + 1);
    let colon = match memchr(b':', &buf[..name_search_end]) {
        Some(idx) => idx,
        None if buf.len() > limits.header_name_size => {
            return HeaderLine::Failed(ParseError::HeaderTooLarge)
        }
        None => return HeaderLine::NeedMore,
    };

    if colon == 0 || buf[..colon].iter().any(|&b| !is_header_name_byte(b)) {
        return HeaderLine::Failed(ParseError::InvalidHeader);
    }

    let value_search_start = colon + 1;
    let value_window_end = buf
        .len()
        .min(value_search_start + limits.header_value_size + 2);
    let window = &buf[value_search_start..value_window_end];

    let crlf_at = match scan_to_crlf(window) {
        Crlf::Found(idx) => idx,
        Crlf::Invalid => return HeaderLine::Failed(ParseError::InvalidHeader),
        Crlf::NeedMore => {
            if buf.len() - value_search_start > limits.header_value_size + 1 {
                return HeaderLine::Failed(ParseError::HeaderTooLarge);
            }
            return HeaderLine::NeedMore;
        }
    };

    let mut value_start = value_search_start;
    let value_end = value_search_start + crlf_at;
    if buf.get(value_start) == Some(&b' ') {
        value_start += 1;
    }

    if value_end - value_start >= limits.header_value_size {
        return HeaderLine::Failed(ParseError::HeaderTooLarge);
    }
    if buf[value_start..value_end]
        .iter()
        .any(|&b| !is_header_value_byte(b))
    {
        return HeaderLine::Failed(ParseError::InvalidHeader);
    }

    HeaderLine::Done {
        name: (0, colon),
        value: (value_start, value_end),
        consumed: value_end + 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::Version;

    fn parser_from(bytes: &[u8]) -> Parser {
        let mut p = Parser::new(&ReqLimits::default());
        p.buf.extend_from_slice(bytes);
        p
    }

    #[rustfmt::skip]
    #[test]
    fn parse_method_cases() {
        let cases: &[(&[u8], Option<(Method, usize)>)] = &[
            (b"GET / HTTP/1.1\r\n",     Some((Method::Get, 4))),
            (b"PUT / HTTP/1.1\r\n",     Some((Method::Put, 4))),
            (b"POST / HTTP/1.1\r\n",    Some((Method::Post, 5))),
            (b"HEAD / HTTP/1.1\r\n",    Some((Method::Head, 5))),
            (b"PATCH / HTTP/1.1\r\n",   Some((Method::Patch, 6))),
            (b"DELETE / HTTP/1.1\r\n",  Some((Method::Delete, 7))),
            (b"OPTIONS / HTTP/1.1\r\n", Some((Method::Options, 8))),
            (b"TRACE / HTTP/1.1\r\n",   None),
        ];

        for (input, expected) in cases {
            let mut p = parser_from(input);
            match (p.parse_method(), expected) {
                (ParseOutcome::Done(m), Some((em, eadv))) => {
                    assert_eq!(m, *em, "input {input:?}");
                    assert_eq!(p.pos(), *eadv, "input {input:?}");
                }
                (ParseOutcome::Failed(ParseError::InvalidMethod), None) => {}
                (other, _) => panic!("unexpected outcome {other:?} for {input:?}"),
            }
        }
    }

    #[test]
    fn parse_method_needs_more_on_partial_tag() {
        let mut p = parser_from(b"GE");
        assert_eq!(p.parse_method(), ParseOutcome::NeedMore);
    }

    #[test]
    fn parse_method_needs_more_on_partial_long_tag() {
        let mut p = parser_from(b"DELE");
        assert_eq!(p.parse_method(), ParseOutcome::NeedMore);
    }

    #[test]
    fn parse_uri_wildcard() {
        let mut p = parser_from(b"* HTTP/1.1\r\n");
        assert_eq!(p.parse_uri(256), ParseOutcome::Done((0, 1)));
        assert_eq!(p.pos(), 2);
    }

    #[test]
    fn parse_uri_normal_path() {
        let mut p = parser_from(b"/a/b HTTP/1.1\r\n");
        assert_eq!(p.parse_uri(256), ParseOutcome::Done((0, 4)));
        assert_eq!(&p.buffer()[0..4], b"/a/b");
    }

    #[test]
    fn parse_uri_too_large() {
        let path = format!("/{}", "a".repeat(300));
        let mut p = parser_from(format!("{path} HTTP/1.1\r\n").as_bytes());
        assert_eq!(p.parse_uri(256), ParseOutcome::Failed(ParseError::UriTooLarge));
    }

    #[test]
    fn parse_uri_needs_more_without_terminating_space() {
        let mut p = parser_from(b"/a/b");
        assert_eq!(p.parse_uri(256), ParseOutcome::NeedMore);
    }

    #[test]
    fn parse_protocol_versions() {
        let mut p = parser_from(b"HTTP/1.1\r\n");
        assert_eq!(p.parse_protocol(), ParseOutcome::Done(Version::Http11));

        let mut p = parser_from(b"HTTP/1.0\r\n");
        assert_eq!(p.parse_protocol(), ParseOutcome::Done(Version::Http10));

        let mut p = parser_from(b"HTTP/2.0\r\n");
        assert_eq!(
            p.parse_protocol(),
            ParseOutcome::Failed(ParseError::InvalidProtocol)
        );

        let mut p = parser_from(b"HTTP/1.1");
        assert_eq!(p.parse_protocol(), ParseOutcome::NeedMore);
    }

    #[test]
    fn parse_headers_basic() {
        let mut p = parser_from(b"host: example.com\r\nx-id: 7\r\n\r\n");
        let mut headers = HeaderMap::new(4);
        let limits = ReqLimits::default();

        assert_eq!(p.parse_headers(&mut headers, &limits), ParseOutcome::Done(()));
        assert_eq!(headers.headers.len(), 2);
        assert_eq!(headers.get(p.buffer(), b"Host"), Some(&b"example.com"[..]));
        assert_eq!(headers.get(p.buffer(), b"X-Id"), Some(&b"7"[..]));
    }

    #[test]
    fn parse_headers_resumes_on_partial_line() {
        let mut headers = HeaderMap::new(4);
        let limits = ReqLimits::default();

        let mut p = parser_from(b"host: exam");
        assert_eq!(p.parse_headers(&mut headers, &limits), ParseOutcome::NeedMore);
        assert_eq!(p.pos(), 0, "no bytes consumed on NeedMore");

        p.buf.extend_from_slice(b"ple.com\r\n\r\n");
        assert_eq!(p.parse_headers(&mut headers, &limits), ParseOutcome::Done(()));
        assert_eq!(headers.get(p.buffer(), b"host"), Some(&b"example.com"[..]));
    }

    #[test]
    fn parse_headers_duplicate_name_last_wins() {
        let mut p = parser_from(b"x-id: 1\r\nx-id: 2\r\n\r\n");
        let mut headers = HeaderMap::new(4);
        let limits = ReqLimits::default();

        p.parse_headers(&mut headers, &limits).unwrap();
        assert_eq!(headers.headers.len(), 1);
        assert_eq!(headers.get(p.buffer(), b"x-id"), Some(&b"2"[..]));
    }

    #[test]
    fn parse_headers_too_many() {
        let mut limits = ReqLimits::default();
        limits.header_count = 1;
        let mut p = parser_from(b"a: 1\r\nb: 2\r\n\r\n");
        let mut headers = HeaderMap::new(1);

        assert_eq!(
            p.parse_headers(&mut headers, &limits),
            ParseOutcome::Failed(ParseError::TooManyHeaders)
        );
    }

    #[test]
    fn parse_headers_invalid_name_byte() {
        let mut p = parser_from(b"bad name: 1\r\n\r\n");
        let mut headers = HeaderMap::new(4);
        let limits = ReqLimits::default();

        assert_eq!(
            p.parse_headers(&mut headers, &limits),
            ParseOutcome::Failed(ParseError::InvalidHeader)
        );
    }

    #[test]
    fn parse_body_none_when_no_headers() {
        let mut p = parser_from(b"");
        let mut headers = HeaderMap::new(0);
        let limits = ReqLimits::default();
        assert_eq!(
            p.parse_body(&mut headers, &limits),
            ParseOutcome::Done(None)
        );
    }

    #[test]
    fn parse_body_reads_content_length() {
        let mut p = parser_from(b"hello");
        let mut headers = HeaderMap::new(1);
        headers
            .headers
            .push(Header::new((0, 0), (0, 0)));
        headers.content_length = Some(5);
        let limits = ReqLimits::default();

        assert_eq!(
            p.parse_body(&mut headers, &limits),
            ParseOutcome::Done(Some((0, 5)))
        );
        assert_eq!(p.pos(), 5);
    }

    #[test]
    fn parse_body_needs_more() {
        let mut p = parser_from(b"he");
        let mut headers = HeaderMap::new(1);
        headers.headers.push(Header::new((0, 0), (0, 0)));
        headers.content_length = Some(5);
        let limits = ReqLimits::default();

        assert_eq!(p.parse_body(&mut headers, &limits), ParseOutcome::NeedMore);
    }

    #[test]
    fn parse_body_too_large() {
        let mut p = parser_from(b"hello");
        let mut headers = HeaderMap::new(1);
        headers.headers.push(Header::new((0, 0), (0, 0)));
        headers.content_length = Some(10_000_000);
        let mut limits = ReqLimits::default();
        limits.body_size = 10;

        assert_eq!(
            p.parse_body(&mut headers, &limits),
            ParseOutcome::Failed(ParseError::TooLarge)
        );
    }

    #[test]
    fn reset_drains_consumed_prefix_and_keeps_pipelined_tail() {
        let mut p = parser_from(b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n");
        p.parse_method().unwrap();
        p.parse_uri(256).unwrap();
        p.parse_protocol().unwrap();
        let mut headers = HeaderMap::new(4);
        p.parse_headers(&mut headers, &ReqLimits::default())
            .unwrap();

        p.reset();
        assert_eq!(p.pos(), 0);
        assert_eq!(&p.buffer()[0..4], b"GET ");
    }

    #[test]
    fn can_keep_alive_requires_http11_and_headers() {
        let buf = b"connection: keep-alive\r\n";
        let mut headers = HeaderMap::new(1);
        headers.headers.push(Header::new((0, 10), (12, 22)));

        assert!(can_keep_alive(buf, &headers, Version::Http11));
        assert!(!can_keep_alive(buf, &headers, Version::Http10));

        let empty = HeaderMap::new(0);
        assert!(!can_keep_alive(buf, &empty, Version::Http11));
    }

    #[test]
    fn can_keep_alive_false_on_connection_close() {
        let buf = b"connection: close\r\n";
        let mut headers = HeaderMap::new(1);
        headers.headers.push(Header::new((0, 10), (12, 17)));

        assert!(!can_keep_alive(buf, &headers, Version::Http11));
    }
}
