//! Counter scope keys.

use serde::{Deserialize, Serialize};

/// The scope of a rate limit counter.
///
/// Two configs with the same limit and duration but different names get
/// different identifiers, so they can never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    /// The config this counter belongs to (or the key ID for ad hoc limits)
    pub config_id: String,
    /// The limit name
    pub name: String,
}

impl Identifier {
    pub fn new(config_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.config_id, self.name)
    }
}

/// One fixed window of one identifier.
///
/// The window length is part of the key: a call that overrides a config's
/// duration, or an ad hoc limit requested with different durations, counts
/// in its own buckets instead of sharing (and re-expiring) another's.
///
/// The derived ordering (identifier, duration, window start) is the lock
/// order used by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub identifier: Identifier,
    pub duration_ms: u64,
    /// Unix ms, aligned to `duration_ms`
    pub window_start: u64,
}

impl BucketKey {
    pub fn new(identifier: Identifier, duration_ms: u64, window_start: u64) -> Self {
        Self {
            identifier,
            duration_ms,
            window_start,
        }
    }

    /// Unix ms after which the bucket may be dropped. A bucket outlives its
    /// own window by one duration so the following window can interpolate
    /// from it.
    pub fn expires_at(&self) -> u64 {
        self.window_start
            .saturating_add(self.duration_ms.saturating_mul(2))
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}ms@{}",
            self.identifier, self.duration_ms, self.window_start
        )
    }
}
