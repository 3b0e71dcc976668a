//! Bounded circular buffer used for every cross-thread handoff.
//!
//! Producers never stall indefinitely: a full buffer evicts its oldest
//! element once the configured push wait has elapsed, keeping latency
//! bounded when a consumer falls behind a live source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default capacity used by the stream caches and writer input buffers.
pub const DEFAULT_RING_CAPACITY: usize = 10;

/// Outcome of a bounded push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Stored without evicting anything
    Stored,
    /// Buffer was full past the wait; oldest element was dropped
    Evicted,
    /// Buffer is closed; the item was discarded
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity MPMC ring with blocking push/pop.
///
/// All mutation happens under one mutex; two condition variables cover the
/// two wait directions. Multiple producers and consumers may share one
/// instance behind an `Arc`.
pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push with a bounded wait for free capacity.
    ///
    /// Blocks up to `wait` while the buffer is full, then drops the oldest
    /// element and admits the new one. A zero wait makes the eviction
    /// immediate.
    pub fn push(&self, item: T, wait: Duration) -> PushResult {
        let deadline = (!wait.is_zero()).then(|| Instant::now() + wait);
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.closed {
                return PushResult::Closed;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.not_empty.notify_one();
                return PushResult::Stored;
            }
            let Some(deadline) = deadline else { break };
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.not_full.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }

        // Still full: bounded-latency policy, evict the oldest.
        inner.items.pop_front();
        inner.items.push_back(item);
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        PushResult::Evicted
    }

    /// Push without waiting; evicts immediately when full.
    pub fn force_push(&self, item: T) -> PushResult {
        self.push(item, Duration::ZERO)
    }

    /// Block until an element is available or the buffer is closed.
    ///
    /// Returns `None` only when the buffer is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Like `pop`, but gives up after `wait`.
    ///
    /// `None` means the wait elapsed or the buffer is closed and drained;
    /// check `is_closed()` to tell the two apart.
    pub fn pop_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Close the buffer and wake every waiter.
    ///
    /// Elements already stored remain poppable; new pushes are discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements evicted by the drop-oldest policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        self.not_full.notify_all();
    }
}
