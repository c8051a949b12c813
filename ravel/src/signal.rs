// src/signal.rs
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;

/// Write end of the self-pipe, published for the async handler. -1 when no
/// pipe is installed.
static SIG_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe handler: one byte, value = signal number, into the pipe.
/// errno is saved and restored so the interrupted syscall sees its own error.
extern "C" fn sig_handler(sig: c_int) {
    let fd = SIG_PIPE_WR.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    unsafe {
        let errno = *libc::__errno_location();
        let byte = sig as u8;
        libc::send(fd, &byte as *const u8 as *const libc::c_void, 1, 0);
        *libc::__errno_location() = errno;
    }
}

/// Self-pipe funneling async signals into the readiness loop.
///
/// A non-blocking socketpair: handlers write single bytes to one end, the loop
/// registers the other end with the mux and drains it on readiness.
pub struct SigPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SigPipe {
    /// Create the pipe and install the handlers: SIGINT/SIGTERM are funneled,
    /// SIGPIPE is ignored outright.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            set_nonblocking(fd)?;
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        SIG_PIPE_WR.store(pipe.write_fd, Ordering::SeqCst);

        install_handler(libc::SIGINT, sig_handler as libc::sighandler_t)?;
        install_handler(libc::SIGTERM, sig_handler as libc::sighandler_t)?;
        install_handler(libc::SIGPIPE, libc::SIG_IGN)?;
        Ok(pipe)
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain pending signal bytes and report whether shutdown was requested.
    /// SIGINT and SIGTERM each set shutdown; anything else is ignored.
    pub fn drain_shutdown(&self) -> bool {
        let mut buf = [0u8; 1024];
        let n = unsafe {
            libc::recv(
                self.read_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n <= 0 {
            return false;
        }
        let mut shutdown = false;
        for &b in &buf[..n as usize] {
            match c_int::from(b) {
                libc::SIGINT => shutdown = true,
                libc::SIGTERM => shutdown = true,
                _ => {}
            }
        }
        shutdown
    }
}

impl Drop for SigPipe {
    fn drop(&mut self) {
        SIG_PIPE_WR.store(-1, Ordering::SeqCst);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn install_handler(sig: c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
