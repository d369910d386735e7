//! Response record and incremental wire parsing.
//!
//! The head ends at the first CRLFCRLF. The body is exactly the declared
//! Content-Length; responses without one are unsupported. The parser
//! publishes a read hint so the driver never pulls bytes beyond the
//! declared length off the socket.

use bytes::{Bytes, BytesMut};

use crate::error::ErrorKind;

/// Parsed HTTP response.
#[derive(Debug)]
pub struct Response {
    proto: String,
    status: u16,
    head: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    /// Protocol from the status line (e.g. `HTTP/1.1`).
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// HTTP status code (e.g. 200, 404).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response headers as (name, value) pairs, in received order.
    pub fn head(&self) -> &[(String, String)] {
        &self.head
    }

    /// First header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reference to the body bytes without consuming.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body bytes.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Consume the response and return the body as UTF-8 text.
    pub fn text(self) -> Option<String> {
        String::from_utf8(self.body.to_vec()).ok()
    }

    /// Whether the connection may be reused after this response:
    /// HTTP/1.1 with no `Connection: close`.
    pub(crate) fn keep_alive(&self) -> bool {
        if self.proto != "HTTP/1.1" {
            return false;
        }
        !self
            .head
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
            .any(|(_, v)| v.eq_ignore_ascii_case("close"))
    }
}

/// Why an incoming response cannot be handled.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
    #[error("malformed status line")]
    BadStatusLine,
    #[error("response has no content-length")]
    MissingContentLength,
    #[error("invalid content-length")]
    BadContentLength,
}

impl ParseError {
    /// Taxonomy kind for the error timeline. A missing Content-Length is
    /// the unsupported-response terminal condition; the rest are parse
    /// failures.
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            ParseError::MissingContentLength => ErrorKind::Terminal,
            _ => ErrorKind::Response,
        }
    }
}

/// How far the parser has come.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    NeedMore,
    Complete,
}

const HEAD_CHUNK: usize = 4096;

/// Incremental response parser: accumulate the head, then exactly
/// Content-Length body bytes. Bytes fed beyond the declared length are
/// ignored; the read hint keeps the driver from consuming them from the
/// socket in the first place.
pub(crate) struct ResponseParser {
    head_buf: BytesMut,
    parsed: Option<ParsedHead>,
    body: BytesMut,
    content_length: usize,
}

struct ParsedHead {
    proto: String,
    status: u16,
    head: Vec<(String, String)>,
}

impl ResponseParser {
    pub(crate) fn new() -> Self {
        ResponseParser {
            head_buf: BytesMut::new(),
            parsed: None,
            body: BytesMut::new(),
            content_length: 0,
        }
    }

    /// Maximum bytes the driver should read next. Zero once complete.
    pub(crate) fn read_hint(&self) -> usize {
        match &self.parsed {
            None => HEAD_CHUNK,
            Some(_) => self.content_length - self.body.len(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.parsed.is_some() && self.body.len() == self.content_length
    }

    /// Feed bytes read from the socket.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Progress, ParseError> {
        if self.parsed.is_none() {
            self.head_buf.extend_from_slice(data);
            let Some(end) = find_head_end(&self.head_buf) else {
                return Ok(Progress::NeedMore);
            };
            let parsed = parse_head(&self.head_buf[..end])?;
            self.content_length = content_length(&parsed.head)?;
            self.parsed = Some(parsed);
            // Body bytes may follow the head in the same read; any excess
            // past the declared length is ignored.
            let rest = &self.head_buf[end + 4..];
            let take = rest.len().min(self.content_length);
            self.body.extend_from_slice(&rest[..take]);
            self.head_buf.clear();
        } else {
            let take = data.len().min(self.content_length - self.body.len());
            self.body.extend_from_slice(&data[..take]);
        }
        if self.is_complete() {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::NeedMore)
        }
    }

    /// Consume the parser once complete.
    pub(crate) fn finish(self) -> Response {
        let parsed = match self.parsed {
            Some(p) => p,
            None => ParsedHead {
                proto: String::new(),
                status: 0,
                head: Vec::new(),
            },
        };
        Response {
            proto: parsed.proto,
            status: parsed.status,
            head: parsed.head,
            body: self.body.freeze(),
        }
    }
}

/// Position of `\r\n\r\n`, the index of its first `\r`.
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(data: &[u8]) -> Result<ParsedHead, ParseError> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::BadStatusLine)?;
    let mut lines = text.split("\r\n");

    // Status line: HTTP/1.1 200 OK (reason phrase optional).
    let status_line = lines.next().ok_or(ParseError::BadStatusLine)?;
    let mut parts = status_line.splitn(3, ' ');
    let proto = parts.next().ok_or(ParseError::BadStatusLine)?;
    if !proto.starts_with("HTTP/") {
        return Err(ParseError::BadStatusLine);
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(ParseError::BadStatusLine)?;

    let mut head = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            head.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(ParsedHead {
        proto: proto.to_string(),
        status,
        head,
    })
}

fn content_length(head: &[(String, String)]) -> Result<usize, ParseError> {
    let value = head
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.as_str())
        .ok_or(ParseError::MissingContentLength)?;
    value.parse().map_err(|_| ParseError::BadContentLength)
}
