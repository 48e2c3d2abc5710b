//! Configuration management for Keygate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{KeygateError, Result};

/// Environment variable prefix, e.g. `KEYGATE__REPLICATION__BATCH_SIZE`.
const ENV_PREFIX: &str = "KEYGATE";

/// Main configuration for a Keygate node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeygateConfig {
    /// Node identity and housekeeping
    #[serde(default)]
    pub node: NodeConfig,

    /// Cross-node replication
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Gossip mesh, used when the replication backend is `mesh`
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Lease tokens
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Path to the key/identity limit catalog
    #[serde(default)]
    pub catalog_path: Option<String>,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// How often expired buckets and lease records are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_sweep_interval() -> u64 {
    1_000
}

/// Where local counter deltas are replicated to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationBackend {
    /// Single node, nothing leaves the process
    #[default]
    None,
    /// In-process shared store
    Memory,
    /// Chitchat gossip mesh
    Mesh,
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub backend: ReplicationBackend,

    /// Outbound buffer size; the oldest events are dropped beyond it
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum events pushed per flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// How often local buckets are raised to the cluster-wide count
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Attempts per flush before the batch is re-queued
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            backend: ReplicationBackend::default(),
            buffer_capacity: default_buffer_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            reconcile_interval_ms: default_reconcile_interval(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl ReplicationConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}

fn default_buffer_capacity() -> usize {
    65_536
}

fn default_batch_size() -> usize {
    1_024
}

fn default_flush_interval() -> u64 {
    100
}

fn default_reconcile_interval() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    50
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Address to listen on for gossip
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address to advertise to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to bootstrap cluster membership
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes must share a cluster ID to gossip
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Grace period before a dead node's state is deleted
    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "keygate".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3_600
}

/// Lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// HMAC secret for lease tokens. Every node that may receive a commit
    /// must share it; a random per-process secret is used when unset.
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// Longest timeout a lease may be issued with
    #[serde(default = "default_max_lease_timeout")]
    pub max_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            max_timeout_ms: default_max_lease_timeout(),
        }
    }
}

fn default_max_lease_timeout() -> u64 {
    3_600_000
}

impl KeygateConfig {
    /// Load configuration from an optional file layered with
    /// `KEYGATE__SECTION__FIELD` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config: KeygateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeygateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| KeygateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.replication.batch_size == 0 {
            return Err(KeygateError::Config("replication.batch_size must be positive".into()));
        }
        if self.replication.buffer_capacity == 0 {
            return Err(KeygateError::Config(
                "replication.buffer_capacity must be positive".into(),
            ));
        }
        if self.lease.max_timeout_ms == 0 {
            return Err(KeygateError::Config("lease.max_timeout_ms must be positive".into()));
        }
        if matches!(&self.lease.signing_secret, Some(secret) if secret.is_empty()) {
            return Err(KeygateError::Config("lease.signing_secret must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KeygateConfig::default();
        assert_eq!(config.replication.backend, ReplicationBackend::None);
        assert_eq!(config.replication.buffer_capacity, 65_536);
        assert_eq!(config.replication.flush_interval(), Duration::from_millis(100));
        assert_eq!(config.mesh.listen_addr.port(), 7946);
        assert_eq!(config.lease.max_timeout_ms, 3_600_000);
        assert!(config.catalog_path.is_none());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
replication:
  backend: mesh
  batch_size: 64
mesh:
  listen_addr: "127.0.0.1:17000"
  seed_nodes: ["127.0.0.1:17001"]
lease:
  signing_secret: "s3cret"
"#;
        let config = KeygateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.replication.backend, ReplicationBackend::Mesh);
        assert_eq!(config.replication.batch_size, 64);
        assert_eq!(config.replication.max_retries, 3);
        assert_eq!(config.mesh.seed_nodes, vec!["127.0.0.1:17001".to_string()]);
        assert_eq!(config.lease.signing_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(KeygateConfig::from_yaml("replication:\n  batch_size: 0\n").is_err());
        assert!(KeygateConfig::from_yaml("lease:\n  signing_secret: \"\"\n").is_err());
        assert!(KeygateConfig::from_yaml("replication:\n  backend: redis\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("keygate-config-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "node:\n  node_id: node-a\n  sweep_interval_ms: 250\n").unwrap();

        let config = KeygateConfig::load(path.to_str()).unwrap();
        assert_eq!(config.node.node_id, "node-a");
        assert_eq!(config.node.sweep_interval_ms, 250);

        std::fs::remove_file(path).unwrap();
    }
}
