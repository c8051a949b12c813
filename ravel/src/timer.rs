// src/timer.rs
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

type ExpireCb = Box<dyn FnOnce()>;

struct TimerNode {
    fd: RawFd,
    deadline: Instant,
    on_expire: ExpireCb,
}

/// Binary min-heap of per-fd expiry timers.
///
/// An `fd -> heap index` map is maintained across every swap, so `adjust` and
/// `cancel` are O(log n) without scanning or lazy tombstones. At most one live
/// entry per fd; `add` on a present fd is a caller bug.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<RawFd, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.index.contains_key(&fd)
    }

    /// Insert a timer for `fd` expiring after `timeout`.
    pub fn add(&mut self, fd: RawFd, timeout: Duration, on_expire: ExpireCb) {
        debug_assert!(!self.index.contains_key(&fd), "duplicate timer for fd {}", fd);
        let idx = self.heap.len();
        self.heap.push(TimerNode {
            fd,
            deadline: Instant::now() + timeout,
            on_expire,
        });
        self.index.insert(fd, idx);
        self.sift_up(idx);
    }

    /// Replace the deadline of `fd`'s entry with `now + timeout`. No-op if the
    /// fd has no live entry.
    pub fn adjust(&mut self, fd: RawFd, timeout: Duration) {
        if let Some(&idx) = self.index.get(&fd) {
            self.heap[idx].deadline = Instant::now() + timeout;
            let idx = self.sift_down(idx);
            self.sift_up(idx);
        }
    }

    /// Remove the entry for `fd` without firing it.
    pub fn cancel(&mut self, fd: RawFd) {
        if let Some(&idx) = self.index.get(&fd) {
            self.remove_at(idx);
        }
    }

    /// Fire every expired callback in non-decreasing deadline order, then
    /// return the milliseconds until the next deadline, or -1 when empty.
    /// Runs on the loop thread; callbacks must not block.
    pub fn tick(&mut self) -> i64 {
        while let Some(top) = self.heap.first() {
            if top.deadline > Instant::now() {
                break;
            }
            let node = self.remove_at(0);
            (node.on_expire)();
        }
        match self.heap.first() {
            Some(top) => top
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as i64,
            None => -1,
        }
    }

    fn remove_at(&mut self, idx: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        self.swap(idx, last);
        let node = self.heap.pop().expect("heap not empty");
        self.index.remove(&node.fd);
        if idx < self.heap.len() {
            let idx = self.sift_down(idx);
            self.sift_up(idx);
        }
        node
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].fd, a);
        self.index.insert(self.heap[b].fd, b);
    }

    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[parent].deadline <= self.heap[idx].deadline {
                break;
            }
            self.swap(parent, idx);
            idx = parent;
        }
        idx
    }

    fn sift_down(&mut self, mut idx: usize) -> usize {
        let len = self.heap.len();
        loop {
            let mut child = idx * 2 + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[idx].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap(idx, child);
            idx = child;
        }
        idx
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
