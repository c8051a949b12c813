// src/pool.rs
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Fixed-size pool of detached worker threads fed from a bounded FIFO.
///
/// The shared state is `Arc`-owned so detached workers outlive the creator's
/// stack. Dropping the pool closes the queue and broadcasts; workers drain the
/// remaining tasks before exiting.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(threads: usize, capacity: usize) -> Self {
        assert!(threads > 0);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::with_capacity(capacity.min(256)),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        for i in 0..threads {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("ravel-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
        }

        Self { shared, capacity }
    }

    /// Append a task and wake one waiter. Returns false when the queue is at
    /// capacity or the pool is closed; the caller decides what to shed.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed || state.tasks.len() >= self.capacity {
                return false;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
        true
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
        }
        self.shared.cond.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.cond.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn single_worker_runs_fifo() {
        let pool = WorkerPool::new(1, 64);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = Arc::clone(&order);
            assert!(pool.submit(move || order.lock().unwrap().push(i)));
        }

        // Closing drains the queue before workers exit.
        drop(pool);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while order.lock().unwrap().len() < 20 {
            assert!(std::time::Instant::now() < deadline, "tasks not drained");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn all_tasks_run_across_workers() {
        let pool = WorkerPool::new(4, 1024);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let done = Arc::clone(&done);
            assert!(pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        drop(pool);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) < 200 {
            assert!(std::time::Instant::now() < deadline, "tasks lost");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn submit_fails_fast_when_full() {
        let pool = WorkerPool::new(1, 2);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();

        // First task parks the only worker on the gate.
        {
            let gate = Arc::clone(&gate);
            assert!(pool.submit(move || {
                let _g = gate.lock().unwrap();
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.queued() > 0 {
            assert!(std::time::Instant::now() < deadline, "worker never started");
            thread::sleep(Duration::from_millis(5));
        }

        assert!(pool.submit(|| {}));
        assert!(pool.submit(|| {}));
        // Queue is at capacity now.
        assert!(!pool.submit(|| {}));

        drop(held);
    }
}
