//! Domain error types for the shard fleet
//!
//! main.rs is the only module allowed to use anyhow::Result (process boundary).
//! Everything else returns Result<T, FleetError>.

use crate::ipc::ClusterId;
use thiserror::Error;

/// Fleet domain errors
///
/// Every variant carries structured context so operators can pattern-match on
/// the failure mode instead of parsing message strings.
///
/// Example log output:
/// ```text
/// FleetError::SpawnFailed { cluster_id: 3, .. }
/// → "failed to spawn worker process for cluster 3"
/// ```
#[derive(Error, Debug)]
pub enum FleetError {
    /// Shard exceeded consecutive error threshold (circuit breaker tripped)
    #[error("shard {shard_id} exceeded consecutive error threshold ({count}/{max})")]
    ShardCircuitBroken { shard_id: u32, count: u32, max: u32 },

    /// Shard reconnection failed (fatal, shard marked dead)
    #[error("shard {shard_id} reconnection failed")]
    ShardReconnectFailed {
        shard_id: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Worker process could not be started
    #[error("failed to spawn worker process for cluster {cluster_id}")]
    SpawnFailed {
        cluster_id: ClusterId,
        #[source]
        source: std::io::Error,
    },

    /// The IPC channel to a worker (or to the manager) is gone
    #[error("IPC channel closed for cluster {cluster_id}")]
    ChannelClosed { cluster_id: ClusterId },

    /// An envelope could not be encoded or decoded
    #[error("IPC envelope codec failed")]
    Codec(#[source] serde_json::Error),

    /// IPC transport read/write failure
    #[error("IPC transport failed")]
    Transport(#[source] std::io::Error),

    /// Gateway recommended shard count query failed
    #[error("recommended shard count query failed")]
    ShardCountQuery(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Hosted application failed to bootstrap inside a worker
    #[error("application bootstrap failed on cluster {cluster_id}: {reason}")]
    Bootstrap { cluster_id: ClusterId, reason: String },

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl FleetError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `fleet_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::ShardCircuitBroken { .. } => "circuit_broken",
            Self::ShardReconnectFailed { .. } => "reconnect_failed",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::Codec(_) => "codec",
            Self::Transport(_) => "transport",
            Self::ShardCountQuery(_) => "shard_count_query",
            Self::Bootstrap { .. } => "bootstrap",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::Config(_) => "config",
        }
    }
}
