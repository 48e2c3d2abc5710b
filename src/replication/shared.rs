//! Cluster-shared counter stores.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::buffer::ReplicationEvent;
use super::ReplicationError;
use crate::ratelimit::{BucketKey, Clock};

/// An aggregated change to one shared counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    pub key: BucketKey,
    pub delta: i64,
    pub expires_at_ms: u64,
}

impl CounterDelta {
    /// Collapse a batch of events into one delta per bucket.
    ///
    /// Buckets whose deltas cancel out are omitted.
    pub fn aggregate(events: &[ReplicationEvent]) -> Vec<CounterDelta> {
        let mut by_key: HashMap<&BucketKey, (i64, u64)> = HashMap::new();
        for event in events {
            let entry = by_key.entry(&event.key).or_insert((0, 0));
            entry.0 = entry.0.saturating_add(event.delta);
            entry.1 = entry.1.max(event.expires_at_ms);
        }

        let mut deltas: Vec<CounterDelta> = by_key
            .into_iter()
            .filter(|(_, (delta, _))| *delta != 0)
            .map(|(key, (delta, expires_at_ms))| CounterDelta {
                key: key.clone(),
                delta,
                expires_at_ms,
            })
            .collect();
        deltas.sort_by(|a, b| a.key.cmp(&b.key));
        deltas
    }

    pub fn into_event(self) -> ReplicationEvent {
        ReplicationEvent {
            key: self.key,
            delta: self.delta,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Store that holds the cluster-wide view of every bucket.
///
/// Only the replication worker talks to it; the request path never does.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically add each delta to its counter (floored at zero) and extend
    /// the counter's expiry.
    async fn apply(&self, deltas: &[CounterDelta]) -> Result<(), ReplicationError>;

    /// Cluster-wide counts for `keys`, in the same order. Unknown or
    /// expired counters read as zero.
    async fn fetch(&self, keys: &[BucketKey]) -> Result<Vec<u64>, ReplicationError>;

    /// Release storage held by expired counters. Returns how many were
    /// removed. Stores that expire entries on their own need not override.
    async fn expire(&self) -> Result<usize, ReplicationError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SharedCounter {
    count: u64,
    expires_at_ms: u64,
}

/// In-process shared store with INCRBY-with-expiry semantics.
///
/// Several nodes in one process can replicate through a single instance.
pub struct MemorySharedStore {
    counters: DashMap<BucketKey, SharedCounter>,
    clock: Arc<dyn Clock>,
}

impl MemorySharedStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop expired counters.
    pub fn sweep(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.expires_at_ms > now_ms);
        before.saturating_sub(self.counters.len())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl std::fmt::Debug for MemorySharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySharedStore")
            .field("counters", &self.counters.len())
            .finish()
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn apply(&self, deltas: &[CounterDelta]) -> Result<(), ReplicationError> {
        let now_ms = self.clock.now_ms();
        for delta in deltas {
            let mut counter = self.counters.entry(delta.key.clone()).or_insert(SharedCounter {
                count: 0,
                expires_at_ms: delta.expires_at_ms,
            });
            if counter.expires_at_ms <= now_ms {
                counter.count = 0;
            }
            counter.count = if delta.delta >= 0 {
                counter.count.saturating_add(delta.delta as u64)
            } else {
                counter.count.saturating_sub(delta.delta.unsigned_abs())
            };
            counter.expires_at_ms = counter.expires_at_ms.max(delta.expires_at_ms);
        }
        Ok(())
    }

    async fn fetch(&self, keys: &[BucketKey]) -> Result<Vec<u64>, ReplicationError> {
        let now_ms = self.clock.now_ms();
        Ok(keys
            .iter()
            .map(|key| {
                self.counters
                    .get(key)
                    .filter(|c| c.expires_at_ms > now_ms)
                    .map(|c| c.count)
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn expire(&self) -> Result<usize, ReplicationError> {
        Ok(self.sweep())
    }
}
