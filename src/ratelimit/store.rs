//! Per-process window counters.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::identifier::BucketKey;
use crate::replication::{ReplicationBuffer, ReplicationEvent};

/// A single fixed-window counter.
///
/// The count lives behind its own mutex so the coordinator can hold the
/// locks of every bucket in a request at once.
#[derive(Debug)]
pub struct Bucket {
    count: Mutex<u64>,
    /// Local deltas queued for the shared store but not yet applied there.
    /// Only changed while `count` is locked, or by the replication worker.
    unflushed: AtomicI64,
    /// Unix ms after which the bucket may be swept
    expires_at: u64,
}

impl Bucket {
    fn new(key: &BucketKey) -> Self {
        Self {
            count: Mutex::new(0),
            unflushed: AtomicI64::new(0),
            expires_at: key.expires_at(),
        }
    }

    /// Lock the counter.
    pub fn lock(&self) -> MutexGuard<'_, u64> {
        self.count.lock()
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Sum of this node's deltas the shared store has not seen yet.
    pub fn unflushed(&self) -> i64 {
        self.unflushed.load(Ordering::Acquire)
    }
}

/// Sharded map of window buckets keyed by (identifier, duration, window start).
///
/// Local mutations are forwarded to the replication buffer when one is
/// attached; nothing here performs I/O.
#[derive(Debug, Default)]
pub struct WindowStore {
    buckets: DashMap<BucketKey, Arc<Bucket>>,
    replication: Option<Arc<ReplicationBuffer>>,
}

impl WindowStore {
    /// Create a store that does not replicate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that enqueues every local change on `buffer`.
    pub fn with_replication(buffer: Arc<ReplicationBuffer>) -> Self {
        Self {
            buckets: DashMap::new(),
            replication: Some(buffer),
        }
    }

    /// Get the bucket for `key`, creating it at zero if absent.
    pub fn bucket(&self, key: &BucketKey) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        // Only the Arc escapes; the shard guard never outlives this call.
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                trace!(key = %key, "Creating window bucket");
                Arc::new(Bucket::new(key))
            })
            .value()
            .clone()
    }

    /// Get the bucket for `key` only if it already exists.
    pub fn existing(&self, key: &BucketKey) -> Option<Arc<Bucket>> {
        self.buckets.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Add `delta` to a bucket and return the new count.
    pub fn increment(&self, key: &BucketKey, delta: u64) -> u64 {
        let bucket = self.bucket(key);
        let mut count = bucket.lock();
        *count = count.saturating_add(delta);
        self.replicate(key, &bucket, delta as i64);
        *count
    }

    /// Subtract `delta` from a bucket, floored at zero, and return the new count.
    ///
    /// A missing bucket is treated as already empty.
    pub fn decrement(&self, key: &BucketKey, delta: u64) -> u64 {
        let Some(bucket) = self.existing(key) else {
            return 0;
        };

        let mut count = bucket.lock();
        let removed = delta.min(*count);
        *count -= removed;
        self.replicate(key, &bucket, -(removed as i64));
        *count
    }

    /// Current count of a bucket, zero if it does not exist.
    pub fn peek(&self, key: &BucketKey) -> u64 {
        self.existing(key).map(|b| *b.lock()).unwrap_or(0)
    }

    /// Raise the local count to the cluster-wide total if it is higher.
    ///
    /// `remote` is what the shared store held when it was read, which lacks
    /// this node's unflushed deltas; those are added back before comparing
    /// so a refund that has not been flushed yet is not undone.
    /// Reconciliation never lowers a count and is not replicated back out.
    /// Buckets this node has not seen (or already swept) are left alone.
    pub fn reconcile(&self, key: &BucketKey, remote: u64) -> Option<u64> {
        let bucket = self.existing(key)?;
        let mut count = bucket.lock();
        let target = (remote as i64).saturating_add(bucket.unflushed()).max(0) as u64;
        if target > *count {
            trace!(key = %key, local = *count, remote, target, "Reconciled bucket to remote count");
            *count = target;
        }
        Some(*count)
    }

    /// Queue a change made under the bucket lock held by the caller.
    pub fn replicate(&self, key: &BucketKey, bucket: &Bucket, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(buffer) = &self.replication {
            bucket.unflushed.fetch_add(delta, Ordering::AcqRel);
            buffer.push(ReplicationEvent {
                key: key.clone(),
                delta,
                expires_at_ms: bucket.expires_at(),
            });
        }
    }

    /// Record that `delta` for `key` has reached the shared store.
    ///
    /// Deltas lost to buffer overflow are never acknowledged, so they keep
    /// counting toward the local view of the bucket.
    pub fn acknowledge(&self, key: &BucketKey, delta: i64) {
        if let Some(bucket) = self.existing(key) {
            bucket.unflushed.fetch_sub(delta, Ordering::AcqRel);
        }
    }

    /// Drop every bucket that expired at or before `now_ms`.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at() > now_ms);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Swept expired window buckets");
        }
        removed
    }

    /// Keys of all buckets still live at `now_ms`, with their expiry.
    pub fn live_keys(&self, now_ms: u64) -> Vec<(BucketKey, u64)> {
        self.buckets
            .iter()
            .filter(|entry| entry.value().expires_at() > now_ms)
            .map(|entry| (entry.key().clone(), entry.value().expires_at()))
            .collect()
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
