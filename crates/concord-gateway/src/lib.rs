//! Gateway client: per-shard protocol state machine and connection
//! cluster.
//!
//! A [`Cluster`] owns a fleet of shards, each a persistent compressed
//! `WebSocket` connection carrying one partition of the event feed.
//! Shards handshake, heartbeat, and resume autonomously; the cluster
//! staggers spawning, aggregates readiness, and delivers decoded
//! [`ClusterEvent`]s to the consumer.

#![warn(missing_docs)]

mod cluster;
mod compression;
mod config;
mod error;
mod events;
mod protocol;
mod shard;

pub use cluster::{Cluster, ClusterHandle};
pub use config::ClusterConfig;
pub use error::GatewayError;
pub use events::{ClusterEvent, DispatchEvent, DispatchKind};
pub use protocol::{GatewayBot, GatewayPayload, SessionStartLimit};
pub use shard::Status;
