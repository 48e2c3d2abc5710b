//! Background flush and reconciliation task.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::buffer::ReplicationBuffer;
use super::shared::{CounterDelta, SharedStore};
use super::ReplicationError;
use crate::config::ReplicationConfig;
use crate::ratelimit::{BucketKey, Clock, WindowStore};

/// Upper bound for the retry backoff.
const MAX_BACKOFF_MS: u64 = 2_000;

/// Pushes buffered local deltas to a [`SharedStore`] and pulls the
/// cluster-wide counts back into the local [`WindowStore`].
pub struct ReplicationWorker {
    buffer: Arc<ReplicationBuffer>,
    store: Arc<WindowStore>,
    shared: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: ReplicationConfig,
}

impl ReplicationWorker {
    pub fn new(
        buffer: Arc<ReplicationBuffer>,
        store: Arc<WindowStore>,
        shared: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            buffer,
            store,
            shared,
            clock,
            config,
        }
    }

    /// Push one batch to the shared store.
    ///
    /// Returns the number of events taken off the buffer. If the store keeps
    /// failing past the retry budget the batch goes back on the buffer and
    /// the last error is returned.
    pub async fn flush(&self) -> Result<usize, ReplicationError> {
        let events = self.buffer.drain(self.config.batch_size);
        if events.is_empty() {
            return Ok(0);
        }
        let drained = events.len();
        let deltas = CounterDelta::aggregate(&events);
        if deltas.is_empty() {
            return Ok(drained);
        }

        let mut attempt = 0u32;
        let mut backoff_ms = self.config.retry_backoff_ms.max(1);
        loop {
            match self.shared.apply(&deltas).await {
                Ok(()) => {
                    for delta in &deltas {
                        self.store.acknowledge(&delta.key, delta.delta);
                    }
                    debug!(events = drained, counters = deltas.len(), "Replicated counter deltas");
                    return Ok(drained);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
                    warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff_ms + jitter,
                        "Replication flush failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        counters = deltas.len(),
                        "Replication flush failed, re-queueing batch"
                    );
                    self.buffer
                        .requeue(deltas.into_iter().map(CounterDelta::into_event).collect());
                    return Err(e);
                }
            }
        }
    }

    /// Flush until the buffer is empty or the store fails.
    ///
    /// Bounded so a producer outpacing the store cannot starve the loop.
    pub async fn flush_all(&self) -> Result<usize, ReplicationError> {
        let max_rounds = self.buffer.capacity() / self.config.batch_size.max(1) + 1;
        let mut total = 0;
        for _ in 0..max_rounds {
            let flushed = self.flush().await?;
            if flushed == 0 {
                break;
            }
            total += flushed;
        }
        Ok(total)
    }

    /// Raise every live local bucket to its cluster-wide count.
    ///
    /// Runs on the same task as [`flush`](Self::flush), so a delta is never
    /// both acknowledged and counted by the store between fetch and apply.
    /// Returns the number of buckets checked.
    pub async fn reconcile(&self) -> Result<usize, ReplicationError> {
        let now_ms = self.clock.now_ms();
        let keys: Vec<BucketKey> = self
            .store
            .live_keys(now_ms)
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        for chunk in keys.chunks(self.config.batch_size.max(1)) {
            let remote = self.shared.fetch(chunk).await?;
            for (key, count) in chunk.iter().zip(remote) {
                self.store.reconcile(key, count);
            }
        }
        Ok(keys.len())
    }

    /// Run the worker on the current tokio runtime.
    pub fn spawn(self) -> ReplicationHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ReplicationHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            flush_interval_ms = self.config.flush_interval_ms,
            reconcile_interval_ms = self.config.reconcile_interval_ms,
            "Replication worker started"
        );

        let mut flush_tick = tokio::time::interval(self.config.flush_interval());
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile_tick = tokio::time::interval(self.config.reconcile_interval());
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = flush_tick.tick() => {
                    let _ = self.flush_all().await;
                }
                _ = self.buffer.notified() => {
                    let _ = self.flush_all().await;
                }
                _ = reconcile_tick.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Reconciliation failed");
                    }
                    match self.shared.expire().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Expired shared counters"),
                        Err(e) => warn!(error = %e, "Shared counter expiry failed"),
                    }
                }
            }
        }

        match self.flush_all().await {
            Ok(flushed) => info!(flushed, "Replication worker stopped"),
            Err(e) => warn!(
                error = %e,
                unflushed = self.buffer.len(),
                "Replication worker stopped with unflushed deltas"
            ),
        }
    }
}

/// Handle to a running [`ReplicationWorker`].
pub struct ReplicationHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplicationHandle {
    /// Stop the worker after a final flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Replication worker panicked");
        }
    }
}
