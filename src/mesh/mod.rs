//! Peer mesh networking module using Chitchat.
//!
//! Gossip-based cluster membership and state dissemination, exposed to the
//! replication layer as a [`SharedStore`](crate::replication::SharedStore)
//! so counters converge without any central storage.

mod cluster;

pub use cluster::{bucket_chitchat_key, Cluster, ClusterConfig, ClusterError};
