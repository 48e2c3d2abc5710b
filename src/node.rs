//! One running engine node: the limiter plus its background tasks.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{KeygateConfig, ReplicationBackend};
use crate::error::Result;
use crate::mesh::{Cluster, ClusterConfig};
use crate::ratelimit::{Clock, LeaseManager, RateLimiter, SystemClock, WindowStore};
use crate::replication::{
    MemorySharedStore, ReplicationBuffer, ReplicationHandle, ReplicationWorker, SharedStore,
};

/// Owns the [`RateLimiter`] and the tasks that keep it healthy: the
/// replication worker (when a backend is configured) and the sweeper that
/// drops expired buckets and lease records.
pub struct Node {
    node_id: String,
    limiter: RateLimiter,
    buffer: Option<Arc<ReplicationBuffer>>,
    replication: Option<ReplicationHandle>,
    cluster: Option<Arc<Cluster>>,
    shutdown: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

impl Node {
    /// Start a node on the system clock with the configured backend.
    pub async fn start(config: &KeygateConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        match config.replication.backend {
            ReplicationBackend::None => Self::start_with(config, clock, None).await,
            ReplicationBackend::Memory => {
                let shared: Arc<dyn SharedStore> = Arc::new(MemorySharedStore::new(clock.clone()));
                Self::start_with(config, clock, Some(shared)).await
            }
            ReplicationBackend::Mesh => {
                let cluster_config =
                    ClusterConfig::from_mesh_config(&config.node.node_id, &config.mesh);
                let cluster = Arc::new(Cluster::start(cluster_config, clock.clone()).await?);
                let mut node =
                    Self::start_with(config, clock, Some(cluster.clone() as Arc<dyn SharedStore>))
                        .await?;
                node.cluster = Some(cluster);
                Ok(node)
            }
        }
    }

    /// Start a node with an explicit clock and shared store.
    ///
    /// Passing the same shared store to several nodes in one process makes
    /// them replicate through it.
    pub async fn start_with(
        config: &KeygateConfig,
        clock: Arc<dyn Clock>,
        shared: Option<Arc<dyn SharedStore>>,
    ) -> Result<Self> {
        let node_id = config.node.node_id.clone();

        let (store, buffer, replication) = match shared {
            Some(shared) => {
                let buffer = Arc::new(ReplicationBuffer::new(
                    config.replication.buffer_capacity,
                    config.replication.batch_size,
                ));
                let store = Arc::new(WindowStore::with_replication(buffer.clone()));
                let handle = ReplicationWorker::new(
                    buffer.clone(),
                    store.clone(),
                    shared,
                    clock.clone(),
                    config.replication.clone(),
                )
                .spawn();
                (store, Some(buffer), Some(handle))
            }
            None => (Arc::new(WindowStore::new()), None, None),
        };

        let secret = match &config.lease.signing_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!("No lease signing secret configured, leases only commit on this node");
                let mut secret = [0u8; 32];
                rand::thread_rng().fill(&mut secret);
                secret.to_vec()
            }
        };
        let leases = LeaseManager::new(secret, config.lease.max_timeout_ms);
        let limiter = RateLimiter::new(store, leases, clock);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_loop(
            limiter.clone(),
            Duration::from_millis(config.node.sweep_interval_ms.max(1)),
            shutdown_rx,
        ));

        info!(
            node_id = %node_id,
            backend = ?config.replication.backend,
            "Node started"
        );

        Ok(Self {
            node_id,
            limiter,
            buffer,
            replication,
            cluster: None,
            shutdown,
            sweeper,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Replication events lost to buffer overflow so far.
    pub fn dropped_events(&self) -> u64 {
        self.buffer.as_ref().map(|b| b.dropped()).unwrap_or(0)
    }

    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    /// Stop background tasks, flushing outstanding replication deltas first.
    pub async fn shutdown(self) -> Result<()> {
        let Node {
            node_id,
            shutdown,
            sweeper,
            replication,
            cluster,
            ..
        } = self;
        info!(node_id = %node_id, "Shutting down node");
        let _ = shutdown.send(true);

        let replication = async move {
            if let Some(replication) = replication {
                replication.shutdown().await;
            }
        };
        let (sweeper, ()) = tokio::join!(sweeper, replication);
        if let Err(e) = sweeper {
            warn!(error = %e, "Sweeper task panicked");
        }

        // The replication worker held the other reference.
        if let Some(cluster) = cluster {
            match Arc::try_unwrap(cluster) {
                Ok(cluster) => cluster.shutdown().await?,
                Err(_) => warn!("Cluster still referenced, skipping graceful leave"),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("limiter", &self.limiter)
            .field("replicating", &self.replication.is_some())
            .finish()
    }
}

async fn sweep_loop(limiter: RateLimiter, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired buckets and lease records");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{KeyContext, LimitRequest, ManualClock};

    fn config(backend: ReplicationBackend) -> KeygateConfig {
        let mut config = KeygateConfig::default();
        config.replication.backend = backend;
        config.lease.signing_secret = Some("test-secret".to_string());
        config
    }

    #[tokio::test]
    async fn test_single_node_lifecycle() {
        let node = Node::start(&config(ReplicationBackend::None)).await.unwrap();
        let ctx = KeyContext::new("ws_1", "key_1");

        let result = node
            .limiter()
            .evaluate(&ctx, &[LimitRequest::named("adhoc").with_limit(2, 60_000)])
            .unwrap();
        assert!(result.success);
        assert_eq!(node.dropped_events(), 0);
        assert!(node.cluster().is_none());

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend_flushes_on_shutdown() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let shared = Arc::new(MemorySharedStore::new(clock.clone()));
        let node = Node::start_with(
            &config(ReplicationBackend::Memory),
            clock.clone(),
            Some(shared.clone() as Arc<dyn SharedStore>),
        )
        .await
        .unwrap();

        let ctx = KeyContext::new("ws_1", "key_1");
        node.limiter()
            .evaluate(&ctx, &[LimitRequest::named("adhoc").with_limit(5, 60_000).with_cost(3)])
            .unwrap();
        node.shutdown().await.unwrap();

        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn test_leases_commit_across_nodes_sharing_secret() {
        let cfg = config(ReplicationBackend::None);
        let a = Node::start(&cfg).await.unwrap();
        let b = Node::start(&cfg).await.unwrap();
        let ctx = KeyContext::new("ws_1", "key_1");

        let outcome = a
            .limiter()
            .issue_lease(&ctx, &LimitRequest::named("adhoc").with_limit(10, 60_000), 30_000)
            .unwrap();
        let lease = outcome.lease.unwrap();
        assert!(b.limiter().commit_lease("ws_1", &lease.token, 1).is_ok());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
