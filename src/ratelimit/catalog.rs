//! Static key and identity limit catalog.
//!
//! In a full deployment a key's limit configs come from the database when
//! the key is loaded. The catalog provides the same data from YAML so the
//! engine can run standalone:
//!
//! ```yaml
//! identities:
//!   - id: id_acme
//!     workspace_id: ws_1
//!     ratelimits:
//!       - name: api_requests
//!         limit: 5
//!         unit: minute
//!         auto_apply: true
//! keys:
//!   - id: key_1
//!     workspace_id: ws_1
//!     identity_id: id_acme
//!     ratelimits:
//!       - name: tokens
//!         limit: 1000
//!         duration_ms: 3600000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::types::{KeyContext, OwnerType, RateLimitConfig};
use crate::error::{KeygateError, Result};

/// Catalog file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub identities: Vec<OwnerEntry>,
    #[serde(default)]
    pub keys: Vec<KeyEntry>,
}

/// An identity and its shared limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub ratelimits: Vec<LimitEntry>,
}

/// A key, its own limits and an optional identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub identity_id: Option<String>,
    #[serde(default)]
    pub ratelimits: Vec<LimitEntry>,
}

/// One named limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitEntry {
    /// Config ID; derived from owner and name when omitted
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub limit: u32,
    /// Window length in ms
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Window length as a named unit, used when `duration_ms` is absent
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub auto_apply: bool,
}

/// Named window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    /// 30 days
    Month,
}

impl TimeUnit {
    pub fn duration_ms(&self) -> u64 {
        match self {
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
            TimeUnit::Month => 2_592_000_000,
        }
    }
}

impl LimitEntry {
    fn to_config(&self, workspace_id: &str, owner_type: OwnerType, owner_id: &str) -> Result<RateLimitConfig> {
        let duration_ms = match (self.duration_ms, self.unit) {
            (Some(ms), _) => ms,
            (None, Some(unit)) => unit.duration_ms(),
            (None, None) => {
                return Err(KeygateError::Config(format!(
                    "ratelimit '{}' of {} needs duration_ms or unit",
                    self.name, owner_id
                )))
            }
        };
        if duration_ms == 0 {
            return Err(KeygateError::Config(format!(
                "ratelimit '{}' of {} has a zero duration",
                self.name, owner_id
            )));
        }

        Ok(RateLimitConfig {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("{}:{}", owner_id, self.name)),
            workspace_id: workspace_id.to_string(),
            owner_type,
            owner_id: owner_id.to_string(),
            name: self.name.clone(),
            limit: self.limit,
            duration_ms,
            auto_apply: self.auto_apply,
        })
    }
}

/// Keys indexed by ID, with their identity's limits already attached.
#[derive(Debug, Clone, Default)]
pub struct LimitCatalog {
    keys: HashMap<String, KeyContext>,
}

impl LimitCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit catalog");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a catalog from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)
            .map_err(|e| KeygateError::Config(format!("Failed to parse limit catalog: {}", e)))?;
        Self::from_catalog_file(file)
    }

    pub fn from_catalog_file(file: CatalogFile) -> Result<Self> {
        let mut identities: HashMap<&str, Vec<RateLimitConfig>> = HashMap::new();
        for identity in &file.identities {
            let configs = identity
                .ratelimits
                .iter()
                .map(|l| l.to_config(&identity.workspace_id, OwnerType::Identity, &identity.id))
                .collect::<Result<Vec<_>>>()?;
            identities.insert(identity.id.as_str(), configs);
        }

        let mut keys = HashMap::with_capacity(file.keys.len());
        for key in &file.keys {
            let identity_limits = match &key.identity_id {
                Some(identity_id) => identities.get(identity_id.as_str()).cloned().ok_or_else(|| {
                    KeygateError::Config(format!(
                        "key {} references unknown identity {}",
                        key.id, identity_id
                    ))
                })?,
                None => Vec::new(),
            };
            let key_limits = key
                .ratelimits
                .iter()
                .map(|l| l.to_config(&key.workspace_id, OwnerType::Key, &key.id))
                .collect::<Result<Vec<_>>>()?;

            keys.insert(
                key.id.clone(),
                KeyContext {
                    workspace_id: key.workspace_id.clone(),
                    key_id: key.id.clone(),
                    key_limits,
                    identity_limits,
                },
            );
        }

        info!(keys = keys.len(), identities = identities.len(), "Limit catalog loaded");
        Ok(Self { keys })
    }

    /// Limit context for a key.
    pub fn key(&self, key_id: &str) -> Option<&KeyContext> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
identities:
  - id: id_acme
    workspace_id: ws_1
    ratelimits:
      - name: api_requests
        limit: 5
        unit: minute
        auto_apply: true
      - id: rl_shared
        name: x
        limit: 1
        duration_ms: 600000
keys:
  - id: key_1
    workspace_id: ws_1
    identity_id: id_acme
    ratelimits:
      - name: x
        limit: 4
        duration_ms: 10000
  - id: key_2
    workspace_id: ws_1
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = LimitCatalog::from_yaml(YAML).unwrap();
        assert_eq!(catalog.len(), 2);

        let key = catalog.key("key_1").unwrap();
        assert_eq!(key.workspace_id, "ws_1");
        assert_eq!(key.key_limits.len(), 1);
        assert_eq!(key.key_limits[0].id, "key_1:x");
        assert_eq!(key.key_limits[0].owner_type, OwnerType::Key);
        assert_eq!(key.identity_limits.len(), 2);
        assert_eq!(key.identity_limits[0].duration_ms, 60_000);
        assert!(key.identity_limits[0].auto_apply);
        assert_eq!(key.identity_limits[1].id, "rl_shared");

        let bare = catalog.key("key_2").unwrap();
        assert!(bare.key_limits.is_empty());
        assert!(bare.identity_limits.is_empty());
        assert!(catalog.key("key_3").is_none());
    }

    #[test]
    fn test_sibling_keys_share_identity_config_ids() {
        let yaml = r#"
identities:
  - id: id_1
    workspace_id: ws_1
    ratelimits:
      - name: shared
        limit: 10
        unit: second
keys:
  - id: key_a
    workspace_id: ws_1
    identity_id: id_1
  - id: key_b
    workspace_id: ws_1
    identity_id: id_1
"#;
        let catalog = LimitCatalog::from_yaml(yaml).unwrap();
        assert_eq!(
            catalog.key("key_a").unwrap().identity_limits[0].id,
            catalog.key("key_b").unwrap().identity_limits[0].id
        );
    }

    #[test]
    fn test_missing_duration_rejected() {
        let yaml = r#"
keys:
  - id: key_1
    workspace_id: ws_1
    ratelimits:
      - name: x
        limit: 4
"#;
        assert!(matches!(LimitCatalog::from_yaml(yaml), Err(KeygateError::Config(_))));
    }

    #[test]
    fn test_unknown_identity_rejected() {
        let yaml = r#"
keys:
  - id: key_1
    workspace_id: ws_1
    identity_id: ghost
"#;
        assert!(matches!(LimitCatalog::from_yaml(yaml), Err(KeygateError::Config(_))));
    }

    #[test]
    fn test_time_unit_durations() {
        assert_eq!(TimeUnit::Second.duration_ms(), 1_000);
        assert_eq!(TimeUnit::Minute.duration_ms(), 60_000);
        assert_eq!(TimeUnit::Hour.duration_ms(), 3_600_000);
        assert_eq!(TimeUnit::Day.duration_ms(), 86_400_000);
        assert_eq!(TimeUnit::Month.duration_ms(), 2_592_000_000);
    }
}
