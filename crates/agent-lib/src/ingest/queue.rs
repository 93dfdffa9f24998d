//! Bounded ingress queue between the sampler and writer threads
//!
//! Single producer, single consumer. The producer never blocks: when the
//! queue is full the oldest enqueued sample is evicted to admit the new
//! one and a drop counter is incremented. The freshest data matters more
//! than completeness for a live monitor, and the sampler must never stall
//! behind a slow writer.

use crate::models::Sample;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tracing::warn;

/// Drops are logged at this interval to keep overflow noise bounded.
const DROP_LOG_EVERY: u64 = 1000;

/// Queue statistics, exposed for logs and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
}

pub struct IngressQueue {
    inner: Mutex<VecDeque<Sample>>,
    available: Condvar,
    capacity: usize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl IngressQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            available: Condvar::new(),
            capacity,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a sample without blocking. Returns `false` when the queue
    /// was full and the oldest sample was evicted to make room.
    pub fn push(&self, sample: Sample) -> bool {
        let evicted = {
            let mut queue = self.inner.lock().unwrap();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(sample);
            evicted
        };
        self.available.notify_one();
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        if evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total % DROP_LOG_EVERY == 0 || total == 1 {
                warn!(dropped_total = total, capacity = self.capacity, "ingress queue full, dropping oldest samples");
            }
        }
        !evicted
    }

    /// Blocking dequeue with a timeout. Returns `None` when the timeout
    /// expires with the queue still empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Sample> {
        let mut queue = self.inner.lock().unwrap();
        if let Some(sample) = queue.pop_front() {
            return Some(sample);
        }
        let (mut queue, result) = self
            .available
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .unwrap();
        if result.timed_out() && queue.is_empty() {
            return None;
        }
        queue.pop_front()
    }

    /// Drain up to `max` samples without blocking.
    pub fn drain(&self, max: usize) -> Vec<Sample> {
        let mut queue = self.inner.lock().unwrap();
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            capacity: self.capacity,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
