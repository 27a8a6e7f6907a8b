//! Shard Fleet - multi-process Discord shard orchestration
//!
//! One manager process partitions the bot's shards into contiguous ranges
//! and runs each range in its own worker process (the same executable,
//! re-launched with a role variable). The manager:
//! - Sequences worker connects through a rate-limited startup queue
//! - Restarts crashed workers under the same cluster id and range
//! - Aggregates worker telemetry into fleet-wide stats
//! - Bridges entity lookups between workers
//! - Exposes health, metrics and control endpoints

pub mod config;
pub mod error;
pub mod health;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod nats;
pub mod notify;
pub mod queue;
pub mod shard;
pub mod worker;

use manager::spawner::{ROLE_ENV, WORKER_ROLE};

pub use config::FleetConfig;
pub use error::FleetError;
pub use manager::{ClusterManager, ClusterStats, FleetStatus};
pub use worker::{Application, ClusterHandle, ClusterLogger, LaunchContext};

/// Install the process-wide rustls provider.
///
/// The dependency graph enables both aws-lc-rs and ring, so rustls cannot
/// pick one on its own and panics on the first TLS client. Must run before
/// any Twilight client or shard is built; later calls are no-ops.
pub fn install_crypto_provider() {
    // Err only means a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Whether this process was started by a manager as a worker
pub fn is_worker_process() -> bool {
    std::env::var(ROLE_ENV).is_ok_and(|role| role == WORKER_ROLE)
}
