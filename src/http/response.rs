//! HTTP response formatting.
//!
//! Responses are formatted into a fixed per-connection header buffer; an
//! append that would overflow the buffer fails and the caller escalates.
//! Status lines always name HTTP/1.1 regardless of the request version.

use super::{HttpCode, WRITE_BUFFER_SIZE};
use std::fmt::{self, Write};

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Server Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";
pub const ERROR_503_TITLE: &str = "Service Unavailable";
pub const ERROR_503_FORM: &str = "The server is currently too busy to process request.\n";

/// Body sent for a zero-length file.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// Status line, title and canned body for a terminal error code.
pub fn error_page(code: HttpCode) -> Option<(u16, &'static str, &'static str)> {
    match code {
        HttpCode::BadRequest => Some((400, ERROR_400_TITLE, ERROR_400_FORM)),
        HttpCode::ForbiddenRequest => Some((403, ERROR_403_TITLE, ERROR_403_FORM)),
        HttpCode::NoResource => Some((404, ERROR_404_TITLE, ERROR_404_FORM)),
        HttpCode::InternalError => Some((500, ERROR_500_TITLE, ERROR_500_FORM)),
        HttpCode::ServiceUnavailable => Some((503, ERROR_503_TITLE, ERROR_503_FORM)),
        _ => None,
    }
}

/// Fixed-capacity response header buffer.
///
/// All append operations return whether they fit; on failure the committed
/// length is unchanged.
pub struct ResponseBuffer {
    buf: [u8; WRITE_BUFFER_SIZE],
    len: usize,
}

impl ResponseBuffer {
    pub fn new() -> ResponseBuffer {
        ResponseBuffer {
            buf: [0u8; WRITE_BUFFER_SIZE],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn status_line(&mut self, status: u16, title: &str) -> bool {
        self.append(format_args!("HTTP/1.1 {status} {title}\r\n"))
    }

    /// Content-Length, Connection and the header-terminating blank line.
    pub fn headers(&mut self, content_length: usize, keep_alive: bool) -> bool {
        let connection = if keep_alive { "keep-alive" } else { "close" };
        self.append(format_args!("Content-Length: {content_length}\r\n"))
            && self.append(format_args!("Connection: {connection}\r\n"))
            && self.append(format_args!("\r\n"))
    }

    pub fn content(&mut self, body: &str) -> bool {
        self.append(format_args!("{body}"))
    }

    fn append(&mut self, args: fmt::Arguments<'_>) -> bool {
        // The committed length always stays short of the buffer size.
        let mut writer = SliceWriter {
            buf: &mut self.buf[..WRITE_BUFFER_SIZE - 1],
            pos: self.len,
        };
        if writer.write_fmt(args).is_ok() {
            self.len = writer.pos;
            true
        } else {
            false
        }
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.pos + bytes.len() > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}
