// src/conn.rs
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use libc::c_void;
use tracing::debug;

use crate::buffer::Buffer;
use crate::request::{self, ParseOutcome};
use crate::response::Response;
use crate::server::Shared;

const READ_BUF_SIZE: usize = 2048;
const WRITE_BUF_SIZE: usize = 1024;

/// Threshold below which a level-triggered write stops looping and waits for
/// the next writable notification.
const WRITE_CONTINUE_THRESHOLD: usize = 10240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Reading,
    Processing,
    Writing,
    Closing,
}

/// Per-connection read/parse/compose/write state machine.
///
/// Exactly one thread touches a connection at a time: the fd is armed
/// one-shot and only re-armed after the handling task returns.
pub struct HttpConn {
    fd: RawFd,
    addr: SocketAddr,
    state: ConnState,
    read_buf: Buffer,
    write_buf: Buffer,
    response: Response,
    keep_alive: bool,
    et: bool,
}

impl HttpConn {
    pub fn new(fd: RawFd, addr: SocketAddr, et: bool) -> Self {
        Self {
            fd,
            addr,
            state: ConnState::Idle,
            read_buf: Buffer::with_capacity(READ_BUF_SIZE),
            write_buf: Buffer::with_capacity(WRITE_BUF_SIZE),
            response: Response::new(),
            keep_alive: false,
            et,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_closing(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes still owed to the peer: buffered headers plus the unsent tail of
    /// the mapped body.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.response.body_remaining()
    }

    /// Drain the socket into the read buffer. Loops until `WouldBlock` when
    /// edge-triggered, reads once otherwise. `Ok(0)` means the peer closed.
    pub fn read(&mut self) -> io::Result<usize> {
        self.state = ConnState::Reading;
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(0);
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.et {
                        break;
                    }
                }
                Err(e) => {
                    if total > 0 && e.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Feed the read buffer to the parser and compose a response.
    ///
    /// Returns true when there is a response to write (arm writable), false
    /// when more request bytes are needed (re-arm readable).
    pub fn process(&mut self, shared: &Shared) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }
        self.state = ConnState::Processing;

        let (path, code, keep_alive, consumed) = match request::parse(self.read_buf.peek()) {
            ParseOutcome::NeedsMore => {
                self.state = ConnState::Reading;
                return false;
            }
            ParseOutcome::Malformed => {
                debug!(fd = self.fd, peer = %self.addr, "malformed request");
                (String::new(), 400, false, self.read_buf.readable())
            }
            ParseOutcome::Complete(req, consumed) => {
                let keep_alive = req.keep_alive();
                let (path, code) = crate::handler::handle(&req, shared);
                (path, code, keep_alive, consumed)
            }
        };

        self.read_buf.consume(consumed);
        self.keep_alive = keep_alive;
        self.response.init(path, keep_alive, code);
        self.response.compose(&shared.src_dir, &mut self.write_buf);
        self.state = ConnState::Writing;
        true
    }

    /// Gather-write the response: one `writev` over the header buffer and the
    /// mapped body tail. Loops while edge-triggered or while a large body
    /// remains; stops on `WouldBlock` (caller re-arms writable).
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let head_len = self.write_buf.readable();
            let head_ptr = self.write_buf.peek().as_ptr();
            let (body_ptr, body_len) = match self.response.body_chunk() {
                Some(chunk) => (chunk.as_ptr(), chunk.len()),
                None => (std::ptr::null(), 0),
            };
            if head_len + body_len == 0 {
                break;
            }

            let iov = [
                libc::iovec {
                    iov_base: head_ptr as *mut c_void,
                    iov_len: head_len,
                },
                libc::iovec {
                    iov_base: body_ptr as *mut c_void,
                    iov_len: body_len,
                },
            ];
            let iov_cnt = if body_len > 0 { 2 } else { 1 };

            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iov_cnt) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if total > 0 && err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(err);
            }

            let n = n as usize;
            total += n;
            if n > head_len {
                self.write_buf.consume(head_len);
                self.response.advance_body(n - head_len);
            } else {
                self.write_buf.consume(n);
            }

            if self.to_write_bytes() == 0 {
                break;
            }
            if !(self.et || self.to_write_bytes() > WRITE_CONTINUE_THRESHOLD) {
                break;
            }
        }
        Ok(total)
    }

    /// Keep-alive turnaround: release the body mapping and parser state, keep
    /// the connection and whatever pipelined bytes are already buffered.
    pub fn reset_for_next(&mut self) {
        self.response.unmap();
        self.write_buf.reset();
        self.keep_alive = false;
        self.state = ConnState::Reading;
    }

    /// Release the mapping and the socket. Safe to call more than once.
    pub fn close(&mut self) {
        self.response.unmap();
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        self.state = ConnState::Closing;
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Shared;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn temp_shared(tag: &str) -> (Shared, PathBuf) {
        let root = std::env::temp_dir().join(format!("ravel-conn-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let src = root.join("resources");
        fs::create_dir_all(src.join("upload")).unwrap();
        let shared = Shared {
            src_dir: src.clone(),
            upload_dir: src.join("upload"),
            user_count: AtomicUsize::new(0),
            conn_et: true,
            db: None,
        };
        (shared, src)
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let r = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(r, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    fn send_all(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::send(fd, data.as_ptr() as *const c_void, data.len(), 0) };
        assert_eq!(n as usize, data.len());
    }

    fn recv_available(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    #[test]
    fn full_round_trip_over_socketpair() {
        let (shared, src) = temp_shared("roundtrip");
        fs::write(src.join("index.html"), "<h1>hi</h1>").unwrap();

        let (server_fd, client_fd) = socketpair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = HttpConn::new(server_fd, addr, true);

        send_all(client_fd, b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");

        assert!(conn.read().unwrap() > 0);
        assert!(conn.process(&shared));
        assert_eq!(conn.state(), ConnState::Writing);
        assert!(!conn.keep_alive());

        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);

        let reply = recv_available(client_fd);
        assert_eq!(
            reply,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-type: text/html\r\nContent-length: 11\r\n\r\n<h1>hi</h1>"
        );

        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn partial_request_keeps_reading() {
        let (shared, _src) = temp_shared("partial");
        let (server_fd, client_fd) = socketpair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = HttpConn::new(server_fd, addr, true);

        send_all(client_fd, b"GET /index.html HT");
        assert!(conn.read().unwrap() > 0);
        assert!(!conn.process(&shared));
        assert_eq!(conn.state(), ConnState::Reading);

        send_all(client_fd, b"TP/1.1\r\n\r\n");
        assert!(conn.read().unwrap() > 0);
        assert!(conn.process(&shared));
        assert_eq!(conn.state(), ConnState::Writing);

        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn keep_alive_resets_between_requests() {
        let (shared, src) = temp_shared("keepalive");
        fs::write(src.join("index.html"), "<h1>hi</h1>").unwrap();

        let (server_fd, client_fd) = socketpair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = HttpConn::new(server_fd, addr, true);

        for _ in 0..2 {
            send_all(
                client_fd,
                b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            );
            assert!(conn.read().unwrap() > 0);
            assert!(conn.process(&shared));
            assert!(conn.keep_alive());
            conn.write().unwrap();
            assert_eq!(conn.to_write_bytes(), 0);

            let reply = recv_available(client_fd);
            let text = String::from_utf8(reply).unwrap();
            assert!(text.starts_with("HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n"));
            assert!(text.ends_with("<h1>hi</h1>"));

            conn.reset_for_next();
            assert_eq!(conn.state(), ConnState::Reading);
        }

        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn malformed_request_composes_400() {
        let (shared, _src) = temp_shared("bad");
        let (server_fd, client_fd) = socketpair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = HttpConn::new(server_fd, addr, true);

        send_all(client_fd, b"GARBAGE\r\n\r\n");
        assert!(conn.read().unwrap() > 0);
        assert!(conn.process(&shared));
        assert!(!conn.keep_alive());

        conn.write().unwrap();
        let reply = recv_available(client_fd);
        assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn peer_close_reads_zero() {
        let (shared, _src) = temp_shared("eof");
        let (server_fd, client_fd) = socketpair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut conn = HttpConn::new(server_fd, addr, true);

        unsafe { libc::close(client_fd) };
        assert_eq!(conn.read().unwrap(), 0);
        let _ = shared;
    }
}
