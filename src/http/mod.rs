//! HTTP/1.x connection handling.
//!
//! The pieces mirror the request lifecycle: `parser` turns buffered bytes
//! into request metadata, `resolver` turns a target into a served file,
//! `response` formats the header buffer, and `conn` ties them to a socket
//! with non-blocking reads and scatter-gather writes.

pub mod conn;
pub mod mapping;
pub mod parser;
pub mod resolver;
pub mod response;

pub use conn::{HttpConn, WriteProgress};

/// Ingress buffer size per connection.
pub const READ_BUFFER_SIZE: usize = 2048;
/// Response header buffer size per connection.
pub const WRITE_BUFFER_SIZE: usize = 1024;
/// Upper bound on a constructed filesystem path, including the terminator.
pub const FILENAME_LEN: usize = 260;

/// Outcome of request processing, shared by the parser, the resolver and
/// the response builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// More bytes are needed before the request is complete.
    NoRequest,
    /// A full request has been parsed.
    GetRequest,
    /// Malformed request; answered with 400.
    BadRequest,
    /// Target does not resolve to a file; answered with 404.
    NoResource,
    /// Target resolved to a servable file; answered with 200.
    FileRequest,
    /// Target is off-limits; answered with 403.
    ForbiddenRequest,
    /// The server failed internally; answered with 500.
    InternalError,
    /// The work queue is saturated; answered with 503.
    ServiceUnavailable,
}
