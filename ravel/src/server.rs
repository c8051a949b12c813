// src/server.rs
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};
use tracing::{debug, error, info, warn};

use ravel_db::{DbConfig, DbPool};

use crate::config::{ActorMode, Config};
use crate::conn::{ConnState, HttpConn};
use crate::epoll::{
    epoll_event, Epoll, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP,
};
use crate::error::{RavelError, RavelResult};
use crate::pool::WorkerPool;
use crate::signal::SigPipe;
use crate::timer::TimerHeap;

/// Connection cap; accepts above it are answered with a busy reply.
const MAX_FD: usize = 65536;

/// Listen backlog.
const BACKLOG: c_int = 6;

const EVENT_BATCH: usize = 1024;

const WORKER_QUEUE_CAP: usize = 4096;

const BUSY_REPLY: &[u8] = b"Server Busy!";

/// State shared between the loop, the workers and the handler layer.
pub struct Shared {
    pub src_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub user_count: AtomicUsize,
    pub conn_et: bool,
    pub db: Option<DbPool>,
}

/// What a finished I/O step wants done with the fd.
enum IoOutcome {
    RearmRead,
    RearmWrite,
    Close,
}

/// The event-loop owner: listen socket, readiness mux, timer heap, worker
/// pool, signal pipe and the fd -> connection map.
pub struct Server {
    cfg: Config,
    listen_fd: RawFd,
    listen_event: u32,
    conn_event: u32,
    epoll: Arc<Epoll>,
    timer: TimerHeap,
    /// Fds whose timers expired; filled by timer callbacks, reaped by the loop.
    expired: Arc<Mutex<Vec<RawFd>>>,
    pool: WorkerPool,
    sig: SigPipe,
    conns: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    shared: Arc<Shared>,
    closing: bool,
}

impl Server {
    pub fn new(cfg: Config) -> RavelResult<Self> {
        cfg.validate()?;

        let root = match &cfg.root_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(RavelError::Io)?,
        };
        let src_dir = root.join("resources");
        let upload_dir = root.join("resources/upload/");
        std::fs::create_dir_all(&upload_dir).map_err(RavelError::Io)?;

        let db = match &cfg.db_url {
            Some(url) => {
                let db_cfg = DbConfig::from_url(url)
                    .map_err(|e| RavelError::Setup(format!("bad database url: {}", e)))?;
                let pool = DbPool::connect(db_cfg, cfg.db_pool_size)
                    .map_err(|e| RavelError::Setup(format!("database pool: {}", e)))?;
                Some(pool)
            }
            None => None,
        };

        let (listen_event, conn_event) = event_mode(cfg.trig_mode);
        let shared = Arc::new(Shared {
            src_dir,
            upload_dir,
            user_count: AtomicUsize::new(0),
            conn_et: conn_event & EPOLLET != 0,
            db,
        });

        let epoll = Arc::new(Epoll::new().map_err(|e| setup("epoll_create", e))?);

        let listen_fd = create_listen_socket(cfg.port, cfg.linger)?;
        epoll
            .add(listen_fd, listen_event | EPOLLIN)
            .map_err(|e| setup("register listen fd", e))?;

        let sig = SigPipe::install().map_err(|e| setup("signal pipe", e))?;
        epoll
            .add(sig.read_fd(), EPOLLRDHUP | EPOLLIN)
            .map_err(|e| setup("register signal pipe", e))?;

        let threads = if cfg.threads == 0 {
            num_cpus::get()
        } else {
            cfg.threads
        };
        let pool = WorkerPool::new(threads, WORKER_QUEUE_CAP);

        let listen_mode = if listen_event & EPOLLET != 0 { "ET" } else { "LT" };
        let conn_mode = if conn_event & EPOLLET != 0 { "ET" } else { "LT" };
        info!(
            port = cfg.port,
            listen_mode,
            conn_mode,
            actor = ?cfg.actor,
            threads,
            timeout_ms = cfg.timeout_ms,
            linger = cfg.linger,
            src_dir = %shared.src_dir.display(),
            "server initialized"
        );

        Ok(Self {
            cfg,
            listen_fd,
            listen_event,
            conn_event,
            epoll,
            timer: TimerHeap::new(),
            expired: Arc::new(Mutex::new(Vec::new())),
            pool,
            sig,
            conns: HashMap::new(),
            shared,
            closing: false,
        })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Run the event loop until a shutdown signal arrives.
    pub fn run(&mut self) {
        info!("server started");
        let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        while !self.closing {
            let mut wait_ms = -1i64;
            if self.cfg.timeout_ms > 0 {
                wait_ms = self.timer.tick();
                self.reap_expired();
            }

            let n = match self.epoll.wait(&mut events, clamp_ms(wait_ms)) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    continue;
                }
            };

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                let bits = ev.events;

                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.sig.read_fd() {
                    if bits & EPOLLIN != 0 && self.sig.drain_shutdown() {
                        info!("shutdown signal received");
                        self.closing = true;
                    }
                } else if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    self.close_conn(fd);
                } else if self.conn_state(fd) == Some(ConnState::Closing) {
                    // A worker flagged the connection and bounced it back.
                    self.close_conn(fd);
                } else if bits & EPOLLIN != 0 {
                    self.deal_read(fd);
                } else if bits & EPOLLOUT != 0 {
                    self.deal_write(fd);
                } else {
                    warn!(fd, events = bits, "unexpected event");
                }
            }
        }

        info!(
            connections = self.conns.len(),
            "server stopping, closing remaining connections"
        );
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close_conn(fd);
        }
    }

    fn conn_state(&self, fd: RawFd) -> Option<ConnState> {
        self.conns
            .get(&fd)
            .map(|c| c.lock().unwrap().state())
    }

    /// Accept-drain: until `EAGAIN` when the listen fd is edge-triggered,
    /// exactly once otherwise.
    fn deal_listen(&mut self) {
        loop {
            let (fd, addr) = match accept_connection(self.listen_fd) {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };

            if self.shared.user_count.load(Ordering::Acquire) >= MAX_FD {
                send_busy(fd);
                warn!("connection cap reached, rejecting client");
                return;
            }
            self.add_client(fd, addr);

            if self.listen_event & EPOLLET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let conn = Arc::new(Mutex::new(HttpConn::new(fd, addr, self.shared.conn_et)));

        if self.cfg.timeout_ms > 0 {
            let expired = Arc::clone(&self.expired);
            self.timer.add(
                fd,
                Duration::from_millis(self.cfg.timeout_ms),
                Box::new(move || expired.lock().unwrap().push(fd)),
            );
        }
        if let Err(e) = self.epoll.add(fd, EPOLLIN | self.conn_event) {
            warn!(fd, error = %e, "failed to register client");
            self.timer.cancel(fd);
            // HttpConn's drop closes the socket.
            return;
        }
        self.conns.insert(fd, conn);
        self.shared.user_count.fetch_add(1, Ordering::AcqRel);
        debug!(fd, peer = %addr, clients = self.conns.len(), "client added");
    }

    /// Any readiness on a connection pushes its expiry out to a full timeout.
    fn extend_time(&mut self, fd: RawFd) {
        if self.cfg.timeout_ms > 0 {
            self.timer
                .adjust(fd, Duration::from_millis(self.cfg.timeout_ms));
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        self.extend_time(fd);
        let conn = match self.conns.get(&fd) {
            Some(c) => Arc::clone(c),
            None => return,
        };
        let epoll = Arc::clone(&self.epoll);
        let shared = Arc::clone(&self.shared);
        let conn_event = self.conn_event;

        match self.cfg.actor {
            ActorMode::Reactor => {
                let submitted = self.pool.submit(move || {
                    let mut c = conn.lock().unwrap();
                    let outcome = read_step(&mut c, &shared);
                    apply_from_worker(&mut c, &epoll, conn_event, outcome);
                });
                if !submitted {
                    warn!(fd, "worker queue full, dropping connection");
                    self.close_conn(fd);
                }
            }
            ActorMode::Proactor => {
                // Syscall on the loop thread; only parse/compose goes to a worker.
                let read_res = { conn.lock().unwrap().read() };
                match read_res {
                    Ok(0) => self.close_conn(fd),
                    Err(ref e) if e.kind() != io::ErrorKind::WouldBlock => self.close_conn(fd),
                    _ => {
                        let submitted = self.pool.submit(move || {
                            let mut c = conn.lock().unwrap();
                            let outcome = process_step(&mut c, &shared);
                            apply_from_worker(&mut c, &epoll, conn_event, outcome);
                        });
                        if !submitted {
                            warn!(fd, "worker queue full, dropping connection");
                            self.close_conn(fd);
                        }
                    }
                }
            }
        }
    }

    fn deal_write(&mut self, fd: RawFd) {
        self.extend_time(fd);
        let conn = match self.conns.get(&fd) {
            Some(c) => Arc::clone(c),
            None => return,
        };
        let epoll = Arc::clone(&self.epoll);
        let conn_event = self.conn_event;

        match self.cfg.actor {
            ActorMode::Reactor => {
                let submitted = self.pool.submit(move || {
                    let mut c = conn.lock().unwrap();
                    let outcome = write_step(&mut c);
                    apply_from_worker(&mut c, &epoll, conn_event, outcome);
                });
                if !submitted {
                    warn!(fd, "worker queue full, dropping connection");
                    self.close_conn(fd);
                }
            }
            ActorMode::Proactor => {
                // The write path runs entirely on the loop thread.
                let outcome = {
                    let mut c = conn.lock().unwrap();
                    write_step(&mut c)
                };
                match outcome {
                    IoOutcome::RearmRead => {
                        let _ = self.epoll.modify(fd, conn_event | EPOLLIN);
                    }
                    IoOutcome::RearmWrite => {
                        let _ = self.epoll.modify(fd, conn_event | EPOLLOUT);
                    }
                    IoOutcome::Close => self.close_conn(fd),
                }
            }
        }
    }

    fn reap_expired(&mut self) {
        let fds: Vec<RawFd> = {
            let mut expired = self.expired.lock().unwrap();
            expired.drain(..).collect()
        };
        for fd in fds {
            debug!(fd, "connection timed out");
            self.close_conn(fd);
        }
    }

    /// The only teardown path: unregister, close, cancel the timer, erase the
    /// map entry, drop the count. Loop thread only.
    fn close_conn(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.remove(&fd) {
            self.timer.cancel(fd);
            let _ = self.epoll.delete(fd);
            let mut c = conn.lock().unwrap();
            debug!(fd, peer = %c.addr(), "closing connection");
            c.close();
            self.shared.user_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.listen_fd);
        }
    }
}

/// Drain the socket and run the parser; decides what readiness to re-arm.
fn read_step(c: &mut HttpConn, shared: &Shared) -> IoOutcome {
    match c.read() {
        Ok(0) => return IoOutcome::Close,
        Err(ref e) if e.kind() != io::ErrorKind::WouldBlock => return IoOutcome::Close,
        _ => {}
    }
    process_step(c, shared)
}

fn process_step(c: &mut HttpConn, shared: &Shared) -> IoOutcome {
    if c.process(shared) {
        IoOutcome::RearmWrite
    } else {
        IoOutcome::RearmRead
    }
}

fn write_step(c: &mut HttpConn) -> IoOutcome {
    match c.write() {
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::RearmWrite,
        Err(_) => IoOutcome::Close,
        Ok(_) => {
            if c.to_write_bytes() == 0 {
                if c.keep_alive() {
                    c.reset_for_next();
                    IoOutcome::RearmRead
                } else {
                    IoOutcome::Close
                }
            } else {
                IoOutcome::RearmWrite
            }
        }
    }
}

/// Workers never tear a connection down themselves: a Close outcome marks the
/// state and re-arms the fd writable (one-shot), bouncing it to the loop,
/// which owns the fd table and the timer heap.
fn apply_from_worker(c: &mut HttpConn, epoll: &Epoll, conn_event: u32, outcome: IoOutcome) {
    let fd = c.fd();
    match outcome {
        IoOutcome::RearmRead => {
            let _ = epoll.modify(fd, conn_event | EPOLLIN);
        }
        IoOutcome::RearmWrite => {
            let _ = epoll.modify(fd, conn_event | EPOLLOUT);
        }
        IoOutcome::Close => {
            c.set_closing();
            let _ = epoll.modify(fd, conn_event | EPOLLOUT);
        }
    }
}

/// Trigger mode: 0 = both level, 1 = connections edge, 2 = listen edge,
/// 3 (and anything else) = both edge. Connections are always one-shot.
fn event_mode(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = EPOLLRDHUP;
    let mut conn_event = EPOLLONESHOT | EPOLLRDHUP;
    match trig_mode {
        0 => {}
        1 => conn_event |= EPOLLET,
        2 => listen_event |= EPOLLET,
        _ => {
            listen_event |= EPOLLET;
            conn_event |= EPOLLET;
        }
    }
    (listen_event, conn_event)
}

fn setup(what: &str, e: io::Error) -> RavelError {
    error!(error = %e, "{} failed", what);
    RavelError::Setup(format!("{}: {}", what, e))
}

fn create_listen_socket(port: u16, linger: bool) -> RavelResult<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(setup("create listen socket", io::Error::last_os_error()));
        }

        // Graceful close: block until queued data drains, up to one second.
        let opt_linger = libc::linger {
            l_onoff: linger as c_int,
            l_linger: 1,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &opt_linger as *const _ as *const c_void,
            mem::size_of_val(&opt_linger) as socklen_t,
        ) < 0
        {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(setup("set SO_LINGER", e));
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(setup("set SO_REUSEADDR", e));
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(setup("bind", e));
        }

        if libc::listen(fd, BACKLOG) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(setup("listen", e));
        }

        Ok(fd)
    }
}

fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(Some((fd, SocketAddr::V4(SocketAddrV4::new(ip, port)))))
    }
}

fn send_busy(fd: RawFd) {
    unsafe {
        let n = libc::send(
            fd,
            BUSY_REPLY.as_ptr() as *const c_void,
            BUSY_REPLY.len(),
            0,
        );
        if n < 0 {
            warn!(fd, "failed to send busy reply");
        }
        libc::close(fd);
    }
}

fn clamp_ms(ms: i64) -> i32 {
    if ms < 0 {
        -1
    } else {
        ms.min(i32::MAX as i64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_modes_select_edge_bits() {
        let (l, c) = event_mode(0);
        assert_eq!(l & EPOLLET, 0);
        assert_eq!(c & EPOLLET, 0);
        assert_ne!(c & EPOLLONESHOT, 0);

        let (l, c) = event_mode(1);
        assert_eq!(l & EPOLLET, 0);
        assert_ne!(c & EPOLLET, 0);

        let (l, c) = event_mode(2);
        assert_ne!(l & EPOLLET, 0);
        assert_eq!(c & EPOLLET, 0);

        let (l, c) = event_mode(3);
        assert_ne!(l & EPOLLET, 0);
        assert_ne!(c & EPOLLET, 0);
    }

    #[test]
    fn wait_clamp() {
        assert_eq!(clamp_ms(-1), -1);
        assert_eq!(clamp_ms(0), 0);
        assert_eq!(clamp_ms(250), 250);
        assert_eq!(clamp_ms(i64::MAX), i32::MAX);
    }
}
