//! Per-connection HTTP state and non-blocking I/O.
//!
//! One `HttpConn` lives in each slot of the fd-indexed table. The owning
//! sub-reactor drives reads and writes; a pool worker drives `process`
//! while the one-shot readiness contract keeps the reactor parked. Every
//! hand-off ends by re-arming interest or closing the connection.

use super::parser::RequestParser;
use super::resolver::{self, FileBody};
use super::response::{self, ResponseBuffer};
use super::HttpCode;
use crate::runtime::poller::{Interest, Poller};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Result of driving a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Everything staged has been sent; dispose per `keep_alive`.
    Complete { keep_alive: bool },
    /// The socket would block; re-arm writable and retry later.
    Again,
}

pub struct HttpConn {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    /// Index of the sub-reactor whose poller holds this fd.
    owner: usize,
    pub parser: RequestParser,
    response: ResponseBuffer,
    body: Option<FileBody>,
    /// Number of scatter-gather segments staged: 0 none, 1 header only,
    /// 2 header plus mapped body.
    iov_count: usize,
    bytes_to_send: usize,
    bytes_sent: usize,
}

impl HttpConn {
    pub fn new() -> HttpConn {
        HttpConn {
            stream: None,
            peer: None,
            owner: 0,
            parser: RequestParser::new(),
            response: ResponseBuffer::new(),
            body: None,
            iov_count: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
        }
    }

    /// A slot is active exactly while it holds a socket.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Take ownership of a freshly accepted socket.
    ///
    /// The caller registers the fd with the owning reactor afterwards; the
    /// slot must be fully initialized before any readiness event can fire.
    pub fn activate(&mut self, stream: TcpStream, peer: SocketAddr, owner: usize) {
        self.reset();
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.owner = owner;
    }

    /// Reinitialize for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.response.clear();
        self.release_body();
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    /// Drain the socket into the read buffer until it would block.
    ///
    /// An error means the connection must be closed: remote EOF, a
    /// transport failure, or a request overflowing the read buffer.
    pub fn read_nonblock(&mut self) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "slot is free"))?;
        let mut total = 0;
        loop {
            if self.parser.is_full() {
                return Err(io::Error::new(io::ErrorKind::Other, "read buffer full"));
            }
            match stream.read(self.parser.spare_mut()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "peer closed the connection",
                    ))
                }
                Ok(n) => {
                    self.parser.advance(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Push staged response bytes until done or the socket blocks.
    ///
    /// The file body is released as soon as the response has been fully
    /// sent or the write fails; completion reports the disposition the
    /// caller must apply.
    pub fn write_nonblock(&mut self) -> io::Result<WriteProgress> {
        if self.bytes_to_send == 0 {
            // Spurious writable with nothing staged: treat as a completed
            // exchange and fold back into the keep-alive reset.
            return Ok(WriteProgress::Complete { keep_alive: true });
        }
        loop {
            let sent = match self.write_some() {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Again)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.release_body();
                    return Err(e);
                }
            };
            if sent == 0 {
                self.release_body();
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket write returned zero",
                ));
            }
            self.bytes_sent += sent;
            if self.bytes_sent >= self.bytes_to_send {
                self.release_body();
                return Ok(WriteProgress::Complete {
                    keep_alive: self.parser.keep_alive,
                });
            }
        }
    }

    /// One scatter-gather (or sendfile) step from the current offset.
    fn write_some(&mut self) -> io::Result<usize> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "slot is free"))?;
        let mut sock: &TcpStream = stream;

        let header = self.response.as_bytes();
        let header_off = self.bytes_sent.min(header.len());
        let header_rest = &header[header_off..];
        let body_off = self.bytes_sent - header_off;

        match &self.body {
            Some(FileBody::Mapped(mapping)) if self.iov_count == 2 => {
                let body_rest = &mapping.as_slice()[body_off..];
                let iov = [IoSlice::new(header_rest), IoSlice::new(body_rest)];
                sock.write_vectored(&iov)
            }
            Some(FileBody::Streamed { file, len }) => {
                if !header_rest.is_empty() {
                    return sock.write(header_rest);
                }
                let remaining = *len - body_off;
                let mut offset = body_off as libc::off_t;
                let n = unsafe {
                    libc::sendfile(stream.as_raw_fd(), file.as_raw_fd(), &mut offset, remaining)
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }
            _ => sock.write(header_rest),
        }
    }

    /// Drive the parser over buffered bytes and stage the response.
    ///
    /// Runs on a pool worker while the one-shot contract keeps the reactor
    /// away from this slot; the re-arm (or close) at the end is the
    /// hand-back point.
    pub fn process(
        &mut self,
        poller: &Poller,
        doc_root: &Path,
        use_sendfile: bool,
        active: &AtomicUsize,
    ) {
        let Some(fd) = self.fd() else { return };
        let code = match self.parser.parse() {
            HttpCode::NoRequest => {
                if let Err(e) = poller.rearm(fd, Interest::Readable) {
                    debug!(fd, error = %e, "Read rearm failed");
                    self.close(poller, active);
                }
                return;
            }
            HttpCode::GetRequest => {
                debug!(
                    fd,
                    method = ?self.parser.method(),
                    version = ?self.parser.version(),
                    url = %String::from_utf8_lossy(self.parser.url()),
                    host = %String::from_utf8_lossy(self.parser.host().unwrap_or(b"-")),
                    content_length = self.parser.content_length(),
                    keep_alive = self.parser.keep_alive,
                    "Request parsed"
                );
                match resolver::resolve(doc_root, self.parser.url(), use_sendfile) {
                    Ok(body) => {
                        self.body = Some(body);
                        HttpCode::FileRequest
                    }
                    Err(code) => code,
                }
            }
            code => code,
        };
        self.stage_response(code, poller, active);
    }

    /// Stage an out-of-band response, e.g. a 503 on queue overload.
    ///
    /// `send_and_exit` forces the close disposition before the header is
    /// formatted so the Connection header and the post-write handling
    /// agree.
    pub fn write_respond(
        &mut self,
        code: HttpCode,
        send_and_exit: bool,
        poller: &Poller,
        active: &AtomicUsize,
    ) {
        if send_and_exit {
            self.parser.keep_alive = false;
        }
        self.stage_response(code, poller, active);
    }

    /// Build the response for `code` and arm write interest.
    ///
    /// A build failure is retried once as a 500; if that also fails the
    /// connection is closed.
    fn stage_response(&mut self, code: HttpCode, poller: &Poller, active: &AtomicUsize) {
        let Some(fd) = self.fd() else { return };
        let mut built = self.process_write(code);
        if !built && code != HttpCode::InternalError {
            built = self.process_write(HttpCode::InternalError);
        }
        if !built {
            debug!(fd, code = ?code, "Response build failed");
            self.close(poller, active);
            return;
        }
        if let Err(e) = poller.rearm(fd, Interest::Writable) {
            debug!(fd, error = %e, "Write rearm failed");
            self.close(poller, active);
        }
    }

    /// Format the response for `code` into the header buffer and stage the
    /// scatter-gather layout. Returns false when the buffer overflows.
    fn process_write(&mut self, code: HttpCode) -> bool {
        self.response.clear();
        self.iov_count = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        let keep_alive = self.parser.keep_alive;

        if code == HttpCode::FileRequest {
            if !self.response.status_line(200, response::OK_200_TITLE) {
                return false;
            }
            let body_len = self.body.as_ref().map_or(0, FileBody::len);
            if body_len != 0 {
                if !self.response.headers(body_len, keep_alive) {
                    return false;
                }
                self.iov_count = match &self.body {
                    Some(FileBody::Mapped(_)) => 2,
                    _ => 1,
                };
                self.bytes_to_send = self.response.len() + body_len;
                return true;
            }
            self.body = None;
            if !self.response.headers(response::EMPTY_FILE_BODY.len(), keep_alive)
                || !self.response.content(response::EMPTY_FILE_BODY)
            {
                return false;
            }
        } else {
            self.release_body();
            let Some((status, title, body)) = response::error_page(code) else {
                return false;
            };
            if !self.response.status_line(status, title)
                || !self.response.headers(body.len(), keep_alive)
                || !self.response.content(body)
            {
                return false;
            }
        }

        self.iov_count = 1;
        self.bytes_to_send = self.response.len();
        true
    }

    /// Shut down the write side; the peer's EOF will close the slot.
    pub fn half_close_write(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    /// De-register and close the socket, freeing the slot.
    ///
    /// De-registration happens before the descriptor is returned to the
    /// kernel so a reused fd can never alias a stale registration.
    pub fn close(&mut self, poller: &Poller, active: &AtomicUsize) {
        if let Some(stream) = self.stream.take() {
            let fd = stream.as_raw_fd();
            if let Err(e) = poller.deregister(fd) {
                debug!(fd, error = %e, "Deregister failed");
            }
            drop(stream);
            self.peer = None;
            self.release_body();
            active.fetch_sub(1, Ordering::Relaxed);
            debug!(fd, "Connection closed");
        }
    }

    /// Drop the file body (unmapping or closing it) exactly once and
    /// invalidate the scatter-gather layout that pointed into it.
    fn release_body(&mut self) {
        self.body = None;
        self.iov_count = 0;
    }
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn activated_conn() -> (HttpConn, TcpStream) {
        let (server, client) = socket_pair();
        let peer = server.peer_addr().unwrap();
        let mut conn = HttpConn::new();
        conn.activate(server, peer, 0);
        (conn, client)
    }

    fn read_until_closed(client: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_canned_response_written() {
        let (mut conn, mut client) = activated_conn();
        assert!(conn.process_write(HttpCode::BadRequest));

        match conn.write_nonblock().unwrap() {
            WriteProgress::Complete { keep_alive } => assert!(!keep_alive),
            other => panic!("unexpected: {other:?}"),
        }
        conn.half_close_write();

        let expected = format!(
            "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            response::ERROR_400_FORM.len(),
            response::ERROR_400_FORM
        );
        assert_eq!(read_until_closed(&mut client), expected.as_bytes());
    }

    #[test]
    fn test_mapped_file_scatter_gather() {
        let dir = std::env::temp_dir().join(format!("fileserv-conn-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = std::fs::File::create(dir.join("index.html")).unwrap();
        file.write_all(b"hi world\n").unwrap();
        drop(file);
        let root = dir.canonicalize().unwrap();

        let (mut conn, mut client) = activated_conn();
        conn.body = Some(resolver::resolve(&root, b"/", false).unwrap());
        assert!(conn.process_write(HttpCode::FileRequest));

        match conn.write_nonblock().unwrap() {
            WriteProgress::Complete { keep_alive } => assert!(!keep_alive),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(conn.body.is_none(), "mapping must be released after send");
        conn.half_close_write();

        let expected =
            "HTTP/1.1 200 OK\r\nContent-Length: 9\r\nConnection: close\r\n\r\nhi world\n";
        assert_eq!(read_until_closed(&mut client), expected.as_bytes());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_keep_alive_disposition_reported() {
        let (mut conn, mut client) = activated_conn();
        conn.parser.keep_alive = true;
        assert!(conn.process_write(HttpCode::BadRequest));

        match conn.write_nonblock().unwrap() {
            WriteProgress::Complete { keep_alive } => assert!(keep_alive),
            other => panic!("unexpected: {other:?}"),
        }

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).unwrap();
        assert!(std::str::from_utf8(&buf[..n])
            .unwrap()
            .contains("Connection: keep-alive"));
    }

    #[test]
    fn test_read_sees_peer_close() {
        let (mut conn, client) = activated_conn();
        drop(client);
        // Drain any pending state; EOF must surface as an error.
        let err = loop {
            match conn.read_nonblock() {
                Ok(_) => std::thread::yield_now(),
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_503_forces_close_header() {
        let (mut conn, _client) = activated_conn();
        // Even a keep-alive request gets Connection: close on overload;
        // the send-and-exit path clears the flag before building.
        conn.parser.keep_alive = true;
        conn.parser.keep_alive = false;
        assert!(conn.process_write(HttpCode::ServiceUnavailable));
        let text = std::str::from_utf8(conn.response.as_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Connection: close"));
    }
}
