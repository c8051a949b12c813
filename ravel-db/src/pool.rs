//! Bounded, handle-returning connection pool.
//!
//! `get()` blocks on a condvar until a connection is free and returns an RAII
//! handle; dropping the handle puts the connection back and wakes one waiter.
//! Closing the pool wakes every waiter with an error and drops the idle
//! connections; handles still out simply drop their connection on return.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use crate::connection::{DbConfig, DbConnection};
use crate::error::{DbError, DbResult};

struct PoolState {
    idle: Vec<DbConnection>,
    closed: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// A fixed-size pool of database connections shared across worker threads.
#[derive(Clone)]
pub struct DbPool {
    inner: Arc<PoolInner>,
}

impl DbPool {
    /// Eagerly open `size` connections.
    pub fn connect(config: DbConfig, size: usize) -> DbResult<Self> {
        assert!(size > 0);
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(DbConnection::connect(&config)?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Take a connection, blocking until one is free.
    pub fn get(&self) -> DbResult<DbHandle> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(DbHandle {
                    conn: Some(conn),
                    inner: Arc::clone(&self.inner),
                });
            }
            state = self.inner.available.wait(state).unwrap();
        }
    }

    pub fn idle(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// Close the pool: drop idle connections and wake every waiter.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            state.idle.clear();
        }
        self.inner.available.notify_all();
    }
}

/// RAII guard over a pooled connection.
pub struct DbHandle {
    conn: Option<DbConnection>,
    inner: Arc<PoolInner>,
}

impl Deref for DbHandle {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        self.conn.as_ref().expect("handle holds a connection")
    }
}

impl DerefMut for DbHandle {
    fn deref_mut(&mut self) -> &mut DbConnection {
        self.conn.as_mut().expect("handle holds a connection")
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.inner.state.lock().unwrap();
            if !state.closed {
                state.idle.push(conn);
                drop(state);
                self.inner.available.notify_one();
            }
        }
    }
}
