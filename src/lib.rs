//! Keygate - Distributed Rate Limiting for API Key Verification
//!
//! This crate implements the rate limiting engine invoked while verifying an
//! API key. Several named limits are evaluated together as one atomic unit
//! with a hybrid sliding window, costs that are unknown up front can be
//! reserved with leases and settled later, and per-node counters converge
//! asynchronously through a shared store or a peer-to-peer gossip mesh.

pub mod config;
pub mod error;
pub mod mesh;
pub mod node;
pub mod ratelimit;
pub mod replication;
pub mod sidecar;
