//! Incremental HTTP/1.x request parser.
//!
//! Two nested state machines run over a fixed ingress buffer. The line
//! scanner seeks CRLF terminators, overwriting the CR and LF bytes with NUL
//! as each line is accepted; the request-part scanner consumes accepted
//! lines and advances REQUEST_LINE -> HEADER -> CONTENT. Both resume
//! cleanly when a request arrives split across reads.

use super::{HttpCode, READ_BUFFER_SIZE};
use std::ops::Range;

/// Request-part scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    RequestLine,
    Header,
    Content,
}

/// Line scanner result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    /// A full CRLF-terminated line was consumed.
    Ok,
    /// The buffer ends mid-line (or on a lone trailing CR).
    Open,
    /// Malformed terminator: CR without LF, or LF without CR.
    Bad,
}

/// Request method token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
}

impl Method {
    fn from_token(token: &[u8]) -> Option<Method> {
        const TOKENS: [(&[u8], Method); 9] = [
            (b"GET", Method::Get),
            (b"POST", Method::Post),
            (b"HEAD", Method::Head),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"TRACE", Method::Trace),
            (b"OPTIONS", Method::Options),
            (b"CONNECT", Method::Connect),
            (b"PATCH", Method::Patch),
        ];
        TOKENS
            .iter()
            .find(|(name, _)| token.eq_ignore_ascii_case(name))
            .map(|&(_, method)| method)
    }
}

/// Protocol version named on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    /// Recognized and recorded, then rejected: only 1.x is spoken here.
    Http20,
}

/// Parser state and ingress buffer for one connection.
pub struct RequestParser {
    buf: [u8; READ_BUFFER_SIZE],
    /// One past the last byte received.
    end: usize,
    /// Next byte the line scanner will look at.
    cursor: usize,
    /// Start of the line currently being scanned.
    line_start: usize,
    state: CheckState,
    method: Method,
    version: HttpVersion,
    url: Range<usize>,
    host: Option<Range<usize>>,
    content_length: usize,
    pub keep_alive: bool,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            buf: [0u8; READ_BUFFER_SIZE],
            end: 0,
            cursor: 0,
            line_start: 0,
            state: CheckState::RequestLine,
            method: Method::Get,
            version: HttpVersion::Http11,
            url: 0..0,
            host: None,
            content_length: 0,
            keep_alive: false,
        }
    }

    /// Forget everything for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.end = 0;
        self.cursor = 0;
        self.line_start = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Get;
        self.version = HttpVersion::Http11;
        self.url = 0..0;
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
    }

    /// Free tail of the ingress buffer for the next socket read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    /// Account for `n` bytes received into the spare region.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.end + n <= READ_BUFFER_SIZE);
        self.end += n;
    }

    pub fn is_full(&self) -> bool {
        self.end >= READ_BUFFER_SIZE
    }

    /// Copy bytes into the buffer, returning how many fit.
    #[cfg(test)]
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(READ_BUFFER_SIZE - self.end);
        self.buf[self.end..self.end + n].copy_from_slice(&data[..n]);
        self.end += n;
        n
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Request target, valid once the request line has been accepted.
    pub fn url(&self) -> &[u8] {
        &self.buf[self.url.clone()]
    }

    /// Host header value, when one was present.
    pub fn host(&self) -> Option<&[u8]> {
        self.host.as_ref().map(|r| &self.buf[r.clone()])
    }

    #[cfg(test)]
    fn raw_buf(&self) -> &[u8; READ_BUFFER_SIZE] {
        &self.buf
    }

    /// Advance the state machine over everything buffered so far.
    ///
    /// Returns `NoRequest` when more bytes are needed, `GetRequest` when a
    /// complete request is available, and an error code otherwise.
    pub fn parse(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                return self.parse_content();
            }
            match self.parse_line() {
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Ok => {}
            }
            let line = self.take_line();
            let code = match self.state {
                CheckState::RequestLine => self.parse_request_line(line),
                CheckState::Header => self.parse_header(line),
                // CONTENT never reaches line scanning.
                CheckState::Content => return HttpCode::InternalError,
            };
            if code != HttpCode::NoRequest {
                return code;
            }
        }
    }

    /// Scan for the next CRLF, NUL-terminating the line in place.
    ///
    /// On `Open` the cursor is left where scanning must resume: at the
    /// buffer end mid-line, or on a CR that was the last byte received.
    fn parse_line(&mut self) -> LineStatus {
        while self.cursor < self.end {
            match self.buf[self.cursor] {
                b'\r' => {
                    if self.cursor + 1 == self.end {
                        return LineStatus::Open;
                    }
                    if self.buf[self.cursor + 1] == b'\n' {
                        self.buf[self.cursor] = 0;
                        self.buf[self.cursor + 1] = 0;
                        self.cursor += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.cursor > 1 && self.buf[self.cursor - 1] == b'\r' {
                        self.buf[self.cursor - 1] = 0;
                        self.buf[self.cursor] = 0;
                        self.cursor += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.cursor += 1,
            }
        }
        LineStatus::Open
    }

    /// Range of the just-accepted line, excluding its (zeroed) terminator.
    fn take_line(&mut self) -> Range<usize> {
        let line = self.line_start..self.cursor - 2;
        self.line_start = self.cursor;
        line
    }

    fn parse_request_line(&mut self, line: Range<usize>) -> HttpCode {
        let base = line.start;
        let text = &self.buf[line];

        let Some(sep) = text.iter().position(|&b| b == b' ' || b == b'\t') else {
            return HttpCode::BadRequest;
        };
        let Some(method) = Method::from_token(&text[..sep]) else {
            return HttpCode::BadRequest;
        };
        self.method = method;
        if method != Method::Get {
            return HttpCode::BadRequest;
        }

        let url_start = skip_blanks(text, sep);
        let Some(version_sep) = text[url_start..]
            .iter()
            .position(|&b| b == b' ' || b == b'\t')
            .map(|i| url_start + i)
        else {
            return HttpCode::BadRequest;
        };
        let version_start = skip_blanks(text, version_sep);

        let version = &text[version_start..];
        self.version = if version.eq_ignore_ascii_case(b"HTTP/1.1") {
            HttpVersion::Http11
        } else if version.eq_ignore_ascii_case(b"HTTP/1.0") {
            HttpVersion::Http10
        } else if version.eq_ignore_ascii_case(b"HTTP/2.0") {
            HttpVersion::Http20
        } else {
            return HttpCode::BadRequest;
        };
        if self.version == HttpVersion::Http20 {
            return HttpCode::BadRequest;
        }

        // An absolute-form target loses its scheme and authority.
        let mut url = url_start..version_sep;
        let target = &text[url.clone()];
        if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
            match target[7..].iter().position(|&b| b == b'/') {
                Some(slash) => url.start += 7 + slash,
                None => return HttpCode::BadRequest,
            }
        }
        if url.is_empty() || text[url.start] != b'/' {
            return HttpCode::BadRequest;
        }

        self.url = base + url.start..base + url.end;
        self.state = CheckState::Header;
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, line: Range<usize>) -> HttpCode {
        if line.is_empty() {
            // A declared body requires a Host header.
            if self.content_length != 0 && self.host.is_none() {
                return HttpCode::BadRequest;
            }
            if self.content_length != 0 {
                self.state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        let base = line.start;
        let text = &self.buf[line];
        if let Some(value) = header_value(text, b"Host:") {
            self.host = Some(base + value.start..base + value.end);
        } else if let Some(value) = header_value(text, b"Connection:") {
            let value = &text[value];
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            } else if value.eq_ignore_ascii_case(b"close") {
                self.keep_alive = false;
            } else {
                return HttpCode::BadRequest;
            }
        } else if let Some(value) = header_value(text, b"Content-Length:") {
            let value = &text[value];
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse::<usize>().ok());
            match parsed {
                Some(n) => self.content_length = n,
                None => return HttpCode::BadRequest,
            }
        }
        // Other headers are ignored.
        HttpCode::NoRequest
    }

    fn parse_content(&mut self) -> HttpCode {
        if self.end - self.cursor >= self.content_length {
            // NUL-terminate the body unless it ends flush with the buffer.
            let terminator = self.cursor + self.content_length;
            if terminator < READ_BUFFER_SIZE {
                self.buf[terminator] = 0;
            }
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn skip_blanks(text: &[u8], mut pos: usize) -> usize {
    while pos < text.len() && (text[pos] == b' ' || text[pos] == b'\t') {
        pos += 1;
    }
    pos
}

/// Match a header name case-insensitively, returning the value range with
/// leading blanks skipped.
fn header_value(text: &[u8], name: &[u8]) -> Option<Range<usize>> {
    if text.len() < name.len() || !text[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    Some(skip_blanks(text, name.len())..text.len())
}
