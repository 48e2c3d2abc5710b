//! Asynchronous cross-node convergence of window counters.
//!
//! The request path only ever touches the local [`WindowStore`]. Every local
//! change is queued on a bounded [`ReplicationBuffer`]; a background
//! [`ReplicationWorker`] pushes batches to a [`SharedStore`] and
//! periodically raises local buckets to the cluster-wide counts. The local
//! decision may therefore lag the cluster by about one reconcile interval.
//!
//! [`WindowStore`]: crate::ratelimit::WindowStore

mod buffer;
mod shared;
mod worker;

use thiserror::Error;

pub use buffer::{ReplicationBuffer, ReplicationEvent};
pub use shared::{CounterDelta, MemorySharedStore, SharedStore};
pub use worker::{ReplicationHandle, ReplicationWorker};

/// Errors talking to a shared store. Never surfaced to rate limit callers.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
}
