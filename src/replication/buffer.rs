//! Bounded outbound queue of counter deltas.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::ratelimit::BucketKey;

/// A local counter change waiting to be pushed to the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    pub key: BucketKey,
    /// Signed so refunds replicate as negative deltas
    pub delta: i64,
    /// When the shared copy may be dropped (unix ms)
    pub expires_at_ms: u64,
}

/// Bounded FIFO between the hot path and the replication worker.
///
/// Pushing never blocks and never allocates beyond `capacity`; when full
/// the oldest event is dropped and counted.
#[derive(Debug)]
pub struct ReplicationBuffer {
    queue: Mutex<VecDeque<ReplicationEvent>>,
    capacity: usize,
    /// Queue length that wakes the worker before its next tick
    flush_threshold: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl ReplicationBuffer {
    pub fn new(capacity: usize, flush_threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            flush_threshold: flush_threshold.clamp(1, capacity),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue an event, evicting the oldest one if the buffer is full.
    pub fn push(&self, event: ReplicationEvent) {
        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(capacity = self.capacity, "Replication buffer full, dropped oldest event");
            }
            queue.push_back(event);
            queue.len()
        };

        if len >= self.flush_threshold {
            self.notify.notify_one();
        }
    }

    /// Remove up to `max` events from the front of the queue.
    pub fn drain(&self, max: usize) -> Vec<ReplicationEvent> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Put events that failed to replicate back at the front.
    ///
    /// They are older than anything queued since, so once the buffer is
    /// full the remainder of them is what gets dropped.
    pub fn requeue(&self, events: Vec<ReplicationEvent>) {
        let mut queue = self.queue.lock();
        for event in events.into_iter().rev() {
            if queue.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            queue.push_front(event);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves once the queue has crossed the flush threshold.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
