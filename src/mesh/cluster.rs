//! Cluster management using Chitchat.
//!
//! Each node publishes its own contribution to every bucket as a key in its
//! chitchat node state. Gossip spreads those keys; the cluster-wide count of
//! a bucket is the sum of the contributions of all live nodes. Keys of
//! expired windows are tombstoned so chitchat can garbage collect them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig, NodeState,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::MeshConfig;
use crate::ratelimit::{BucketKey, Clock};
use crate::replication::{CounterDelta, ReplicationError, SharedStore};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl ClusterConfig {
    pub fn from_mesh_config(node_id: &str, mesh: &MeshConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_addr: mesh.listen_addr,
            advertise_addr: mesh.advertise_addr.unwrap_or(mesh.listen_addr),
            seed_nodes: mesh.seed_nodes.clone(),
            cluster_id: mesh.cluster_id.clone(),
            gossip_interval: Duration::from_millis(mesh.gossip_interval_ms.max(1)),
            dead_node_grace_period: Duration::from_secs(mesh.dead_node_grace_period_secs),
        }
    }
}

const BUCKET_KEY_PREFIX: &str = "rl|";

/// Chitchat key for a bucket.
///
/// Format: "rl|{config_id}|{name}|{duration_ms}|{window_start}"
pub fn bucket_chitchat_key(key: &BucketKey) -> String {
    format!(
        "{}{}|{}|{}|{}",
        BUCKET_KEY_PREFIX,
        key.identifier.config_id,
        key.identifier.name,
        key.duration_ms,
        key.window_start
    )
}

/// Expiry of the bucket behind a chitchat key, `None` for foreign keys.
///
/// Parsed from the right, so names containing `|` still work.
fn chitchat_key_expiry(key: &str) -> Option<u64> {
    let mut parts = key.strip_prefix(BUCKET_KEY_PREFIX)?.rsplitn(3, '|');
    let window_start: u64 = parts.next()?.parse().ok()?;
    let duration_ms: u64 = parts.next()?.parse().ok()?;
    parts.next()?;
    Some(window_start.saturating_add(duration_ms.saturating_mul(2)))
}

/// Tombstone every bucket key in `state` that expired at or before `now_ms`.
fn delete_expired(state: &mut NodeState, now_ms: u64) -> usize {
    let expired: Vec<String> = state
        .iter_prefix(BUCKET_KEY_PREFIX)
        .filter(|(key, _)| chitchat_key_expiry(key).is_some_and(|at| at <= now_ms))
        .map(|(key, _)| key.to_string())
        .collect();
    for key in &expired {
        state.delete(key);
    }
    expired.len()
}

/// The cluster handle for distributed counter state.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig, clock: Arc<dyn Clock>) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
            clock,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Sum a key across all live nodes.
    fn sum_live(chitchat: &chitchat::Chitchat, key: &str) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(key))
            .filter_map(|value| value.parse::<u64>().ok())
            .sum()
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl SharedStore for Cluster {
    async fn apply(&self, deltas: &[CounterDelta]) -> Result<(), ReplicationError> {
        let now_ms = self.clock.now_ms();
        let chitchat_arc = self.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();

        for delta in deltas.iter().filter(|d| d.expires_at_ms > now_ms) {
            let key = bucket_chitchat_key(&delta.key);
            let local: u64 = state.get(&key).and_then(|v| v.parse().ok()).unwrap_or(0);
            let updated = if delta.delta >= 0 {
                local.saturating_add(delta.delta as u64)
            } else {
                local.saturating_sub(delta.delta.unsigned_abs())
            };
            state.set(&key, updated.to_string());
        }

        debug!(node_id = %self.node_id, counters = deltas.len(), "Published local contributions");
        Ok(())
    }

    async fn fetch(&self, keys: &[BucketKey]) -> Result<Vec<u64>, ReplicationError> {
        let chitchat_arc = self.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Ok(keys
            .iter()
            .map(|key| Self::sum_live(&chitchat, &bucket_chitchat_key(key)))
            .collect())
    }

    async fn expire(&self) -> Result<usize, ReplicationError> {
        let now_ms = self.clock.now_ms();
        let chitchat_arc = self.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let removed = delete_expired(chitchat.self_node_state(), now_ms);
        if removed > 0 {
            debug!(node_id = %self.node_id, removed, "Deleted expired contributions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Identifier, ManualClock};

    async fn start(config: ClusterConfig) -> Cluster {
        Cluster::start(config, Arc::new(ManualClock::new(0))).await.unwrap()
    }

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    fn delta(key: &BucketKey, delta: i64) -> CounterDelta {
        CounterDelta {
            key: key.clone(),
            delta,
            expires_at_ms: u64::MAX,
        }
    }

    #[test]
    fn test_bucket_chitchat_key() {
        let key = BucketKey::new(Identifier::new("rl_1", "api_requests"), 60_000, 1704067200000);
        assert_eq!(bucket_chitchat_key(&key), "rl|rl_1|api_requests|60000|1704067200000");
    }

    #[test]
    fn test_chitchat_key_expiry() {
        let key = BucketKey::new(Identifier::new("rl_1", "a|b"), 60_000, 120_000);
        assert_eq!(chitchat_key_expiry(&bucket_chitchat_key(&key)), Some(key.expires_at()));
        assert_eq!(chitchat_key_expiry("rl|rl_1|x|soon|0"), None);
        assert_eq!(chitchat_key_expiry("other|1|2"), None);
    }

    #[test]
    fn test_cluster_config_from_mesh() {
        let mesh = MeshConfig {
            listen_addr: "127.0.0.1:7000".parse().unwrap(),
            gossip_interval_ms: 20,
            ..MeshConfig::default()
        };
        let config = ClusterConfig::from_mesh_config("node-a", &mesh);
        assert_eq!(config.advertise_addr, mesh.listen_addr);
        assert_eq!(config.gossip_interval, Duration::from_millis(20));
        assert_eq!(config.cluster_id, "keygate");
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let cluster = start(test_config(17946)).await;

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_apply_and_fetch() {
        let cluster = start(test_config(17947)).await;
        let key = BucketKey::new(Identifier::new("rl_1", "x"), 1_000, 1_000);
        let other = BucketKey::new(Identifier::new("rl_1", "y"), 1_000, 1_000);

        cluster.apply(&[delta(&key, 5)]).await.unwrap();
        cluster.apply(&[delta(&key, 3)]).await.unwrap();
        assert_eq!(cluster.fetch(&[key.clone(), other]).await.unwrap(), vec![8, 0]);

        cluster.apply(&[delta(&key, -10)]).await.unwrap();
        assert_eq!(cluster.fetch(&[key]).await.unwrap(), vec![0]);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes_sum_contributions() {
        let cluster1 = start(test_config(17948)).await;

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let cluster2 = start(config2).await;

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        let key = BucketKey::new(Identifier::new("rl_1", "shared"), 1_000, 1_000);
        cluster1.apply(&[delta(&key, 10)]).await.unwrap();
        cluster2.apply(&[delta(&key, 5)]).await.unwrap();

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cluster1.fetch(&[key.clone()]).await.unwrap(), vec![15]);
        assert_eq!(cluster2.fetch(&[key]).await.unwrap(), vec![15]);

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_deletes_expired_windows() {
        let clock = Arc::new(ManualClock::new(0));
        let cluster = Cluster::start(test_config(17950), clock.clone()).await.unwrap();
        let short = BucketKey::new(Identifier::new("rl_1", "x"), 1_000, 1_000);
        let long = BucketKey::new(Identifier::new("rl_1", "x"), 60_000, 0);
        let expiring = |key: &BucketKey, delta| CounterDelta {
            key: key.clone(),
            delta,
            expires_at_ms: key.expires_at(),
        };

        cluster.apply(&[expiring(&short, 4), expiring(&long, 2)]).await.unwrap();
        assert_eq!(cluster.expire().await.unwrap(), 0);

        clock.set(short.expires_at());
        assert_eq!(cluster.expire().await.unwrap(), 1);
        {
            let chitchat_arc = cluster.chitchat();
            let mut chitchat = chitchat_arc.lock().await;
            let state = chitchat.self_node_state();
            assert_eq!(state.get(&bucket_chitchat_key(&short)), None);
            assert_eq!(state.get(&bucket_chitchat_key(&long)), Some("2"));
        }
        assert_eq!(cluster.fetch(&[short.clone(), long]).await.unwrap(), vec![0, 2]);

        // Late deltas for an expired window are not republished.
        cluster.apply(&[expiring(&short, 1)]).await.unwrap();
        assert_eq!(cluster.fetch(&[short]).await.unwrap(), vec![0]);

        cluster.shutdown().await.unwrap();
    }
}
