//! Worker telemetry sampling
//!
//! Builds the `stats-report` payload from the entity cache, the shard state
//! table and the process's resident memory.

use super::cache::EntityCache;
use crate::ipc::WorkerStats;
use crate::shard::ShardState;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;

/// Collects worker stats on demand
pub struct TelemetrySampler {
    system: System,
    pid: Pid,
    started_at: Instant,
}

impl TelemetrySampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
            started_at: Instant::now(),
        }
    }

    /// Resident memory of this process in bytes; 0 if unavailable
    pub fn memory_bytes(&mut self) -> u64 {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|process| process.memory())
            .unwrap_or(0)
    }

    pub fn sample(&mut self, cache: &EntityCache, shards: &ShardState) -> WorkerStats {
        let counts = cache.counts();
        WorkerStats {
            guilds: counts.guilds,
            users: counts.users,
            voice: counts.voice,
            large_guilds: counts.large_guilds,
            exclusive_guilds: counts.exclusive_guilds,
            memory_bytes: self.memory_bytes(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            shard_count: shards.shard_count() as u32,
            events_received: shards.total_events_received(),
            shards: shards.statuses(),
        }
    }
}

impl Default for TelemetrySampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardHealth;
    use crate::worker::cache::CachedGuild;

    #[test]
    fn sample_combines_cache_and_shards() {
        let cache = EntityCache::new();
        cache.insert_guild(CachedGuild {
            id: 1,
            name: "one".to_string(),
            shard_id: 0,
            member_count: 300,
            large: true,
            bots: 1,
        });
        let shards = ShardState::new(0..2);
        shards.set_health(0, ShardHealth::Ready);

        let stats = TelemetrySampler::new().sample(&cache, &shards);
        assert_eq!(stats.guilds, 1);
        assert_eq!(stats.large_guilds, 1);
        assert_eq!(stats.exclusive_guilds, 1);
        assert_eq!(stats.shard_count, 2);
        assert_eq!(stats.shards.len(), 2);
        assert!(stats.shards[0].ready);
    }

    #[test]
    fn own_process_memory_is_reported() {
        assert!(TelemetrySampler::new().memory_bytes() > 0);
    }
}
