// src/buffer.rs
use libc::c_void;
use std::io;
use std::os::unix::io::RawFd;

const DEFAULT_CAPACITY: usize = 1024;

/// Stack-side overflow slice for the scatter read: one syscall drains a ready
/// socket even under edge-triggered notification.
const EXTRA_BUF_SIZE: usize = 65535;

/// Growable byte buffer with a read cursor and a write cursor.
///
/// Invariant: `0 <= r <= w <= cap`. Readable bytes live in `[r, w)`, writable
/// space in `[w, cap)`, and `[0, r)` is reclaimable by compaction.
pub struct Buffer {
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            r: 0,
            w: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.w - self.r
    }

    pub fn writable(&self) -> usize {
        self.buf.len() - self.w
    }

    pub fn prependable(&self) -> usize {
        self.r
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.r..self.w]
    }

    /// Mark `n` readable bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.readable());
        self.r += n;
    }

    /// Consume through `end`, a position inside the readable region obtained
    /// from `peek` (typically the byte after a located delimiter).
    pub fn consume_to(&mut self, end: *const u8) {
        let start = self.peek().as_ptr() as usize;
        let end = end as usize;
        assert!(end >= start && end - start <= self.readable());
        self.consume(end - start);
    }

    /// Zero the contents and rewind both cursors.
    pub fn reset(&mut self) {
        self.buf.fill(0);
        self.r = 0;
        self.w = 0;
    }

    /// Copy the readable region out as a String, then reset.
    pub fn drain_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.reset();
        s
    }

    /// Guarantee at least `n` writable bytes: compact if the already-read
    /// prefix covers the shortfall, otherwise grow to `w + n + 1`.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable() < n {
            self.make_space(n);
        }
        debug_assert!(self.writable() >= n);
    }

    fn make_space(&mut self, n: usize) {
        if self.writable() + self.prependable() < n {
            self.buf.resize(self.w + n + 1, 0);
        } else {
            let readable = self.readable();
            self.buf.copy_within(self.r..self.w, 0);
            self.r = 0;
            self.w = readable;
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.w..self.w + data.len()].copy_from_slice(data);
        self.w += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Scatter read from `fd`: one `readv` into the writable tail plus a
    /// stack-local overflow slice, so a ready socket is drained in a single
    /// syscall. Overflow is appended (growing the buffer) after the tail
    /// fills. Returns the total byte count; `Ok(0)` is end of stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.w) } as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut c_void,
                iov_len: extra.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.w += n;
        } else {
            self.w = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` in one syscall and consume what was
    /// accepted.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.r) as *const c_void,
                self.readable(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.r += n as usize;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_law(b: &Buffer) {
        assert_eq!(b.readable() + b.writable() + b.prependable(), b.capacity());
    }

    #[test]
    fn append_and_consume() {
        let mut b = Buffer::with_capacity(16);
        b.append(b"hello world");
        assert_eq!(b.peek(), b"hello world");
        cursor_law(&b);

        b.consume(6);
        assert_eq!(b.peek(), b"world");
        assert_eq!(b.prependable(), 6);
        cursor_law(&b);

        b.consume(5);
        assert_eq!(b.readable(), 0);
        cursor_law(&b);
    }

    #[test]
    fn compact_before_grow() {
        let mut b = Buffer::with_capacity(16);
        b.append(b"0123456789");
        b.consume(8);
        // 6 free at the tail + 8 prependable >= 10: must compact, not grow.
        b.ensure_writable(10);
        assert_eq!(b.capacity(), 16);
        assert_eq!(b.peek(), b"89");
        assert!(b.writable() >= 10);
        cursor_law(&b);
    }

    #[test]
    fn grow_when_compaction_insufficient() {
        let mut b = Buffer::with_capacity(8);
        b.append(b"abcdef");
        b.ensure_writable(32);
        assert!(b.writable() >= 32);
        assert_eq!(b.peek(), b"abcdef");
        cursor_law(&b);
    }

    #[test]
    fn consume_to_delimiter() {
        let mut b = Buffer::new();
        b.append(b"line one\r\nrest");
        let pos = b.peek().windows(2).position(|w| w == b"\r\n").unwrap();
        let end = unsafe { b.peek().as_ptr().add(pos + 2) };
        b.consume_to(end);
        assert_eq!(b.peek(), b"rest");
        cursor_law(&b);
    }

    #[test]
    fn reset_and_drain() {
        let mut b = Buffer::new();
        b.append(b"payload");
        assert_eq!(b.drain_to_string(), "payload");
        assert_eq!(b.readable(), 0);
        assert_eq!(b.prependable(), 0);

        b.append(b"again");
        b.reset();
        assert_eq!(b.readable(), 0);
        cursor_law(&b);
    }

    #[test]
    fn scatter_read_spills_into_overflow() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        // More than the initial writable space so the overflow path runs.
        let payload: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        let wrote = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const c_void,
                payload.len(),
            )
        };
        assert_eq!(wrote as usize, payload.len());

        let mut b = Buffer::with_capacity(128);
        let n = b.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(b.peek(), &payload[..]);
        cursor_law(&b);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn write_fd_consumes_written_bytes() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mut b = Buffer::new();
        b.append(b"response bytes");
        let n = b.write_fd(fds[1]).unwrap();
        assert_eq!(n, 14);
        assert_eq!(b.readable(), 0);

        let mut out = [0u8; 64];
        let got = unsafe { libc::read(fds[0], out.as_mut_ptr() as *mut c_void, out.len()) };
        assert_eq!(&out[..got as usize], b"response bytes");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
