//! Error types for the Keygate engine.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::replication::ReplicationError;

/// Main error type for Keygate operations.
#[derive(Error, Debug)]
pub enum KeygateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input, rejected before any limit is evaluated
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A key referenced by a request is not in the limit catalog
    #[error("Not found: {0}")]
    NotFound(String),

    /// Gossip mesh errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Shared-store replication errors
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for KeygateError {
    fn from(err: config::ConfigError) -> Self {
        KeygateError::Config(err.to_string())
    }
}

/// Request validation failures.
///
/// None of these ever reach the window store, so a validation error
/// guarantees that no counter was touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cost for ratelimit '{name}' must not be negative, got {cost}")]
    NegativeCost { name: String, cost: i64 },

    #[error("limit for ratelimit '{name}' must be between 0 and {}, got {limit}", u32::MAX)]
    InvalidLimit { name: String, limit: i64 },

    #[error("duration for ratelimit '{name}' must be positive, got {duration}")]
    InvalidDuration { name: String, duration: i64 },

    #[error("ratelimit '{0}' was requested but does not exist for this key")]
    UnknownLimit(String),

    #[error("ratelimit '{0}' was requested more than once")]
    DuplicateLimit(String),

    #[error("lease timeout must be between 1 and {max} ms, got {timeout}")]
    InvalidLeaseTimeout { timeout: i64, max: u64 },

    #[error("actual cost must not be negative, got {0}")]
    NegativeActualCost(i64),

    #[error("lease token is malformed: {0}")]
    MalformedLease(String),

    #[error("lease token was not issued for this workspace")]
    LeaseSignature,

    #[error("lease {0} has expired")]
    LeaseExpired(String),

    #[error("lease {0} was already committed")]
    LeaseAlreadyCommitted(String),
}

/// Result type alias for Keygate operations.
pub type Result<T> = std::result::Result<T, KeygateError>;
