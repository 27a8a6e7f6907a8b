//! Shard state tracking
//!
//! Tracks health and latency of every shard a worker owns. Shard tasks write,
//! the supervisor and telemetry sampler read.

use crate::ipc::ShardStatus;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Health status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardHealth {
    /// Shard is connecting
    Connecting,
    /// Shard is ready and receiving events
    Ready,
    /// Shard is resuming after disconnect
    Resuming,
    /// Shard is disconnected
    Disconnected,
    /// Shard encountered a fatal error
    Dead,
}

impl ShardHealth {
    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardHealth::Ready)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub health: ShardHealth,
    pub events_received: AtomicU64,
    pub latency: Option<Duration>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            health: ShardHealth::Connecting,
            events_received: AtomicU64::new(0),
            latency: None,
        }
    }
}

/// Shared state across all shards of one cluster
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    shards: DashMap<u32, ShardStateEntry>,
}

impl ShardState {
    pub fn new(shard_ids: impl Iterator<Item = u32>) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner { shards }),
        }
    }

    /// Update shard health
    pub fn set_health(&self, shard_id: u32, health: ShardHealth) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.health = health;
        }
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat acknowledgement and the shard's current latency
    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            if latency.is_some() {
                entry.latency = latency;
            }
        }
    }

    /// Get health for a specific shard
    pub fn get_health(&self, shard_id: u32) -> Option<ShardHealth> {
        self.inner.shards.get(&shard_id).map(|e| e.health)
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health.is_ready())
            .count()
    }

    /// Get total shard count in this cluster
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Every shard of the cluster is ready
    pub fn all_ready(&self) -> bool {
        self.shard_count() > 0 && self.ready_shards() == self.shard_count()
    }

    /// Per-shard status ordered by shard id, as reported in telemetry
    pub fn statuses(&self) -> Vec<ShardStatus> {
        let mut statuses: Vec<ShardStatus> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardStatus {
                id: *e.key(),
                ready: e.health.is_ready(),
                latency_ms: e.latency.map(|l| l.as_millis() as u64),
                status: e.health,
            })
            .collect();
        statuses.sort_by_key(|s| s.id);
        statuses
    }
}
