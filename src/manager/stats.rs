//! Fleet-wide telemetry aggregation
//!
//! One round per stats interval: the manager asks every reachable worker
//! for a report tagged with the round id, and the aggregate is published
//! once every asked worker has answered.

use crate::ipc::{ClusterId, RoundId, WorkerStats};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// Aggregate across every cluster of the fleet
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterStats {
    pub guilds: u64,
    pub users: u64,
    pub voice: u64,
    pub large_guilds: u64,
    pub exclusive_guilds: u64,
    pub total_memory_bytes: u64,
    /// Per-cluster breakdown, ascending cluster id
    pub clusters: Vec<ClusterStatsEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatsEntry {
    pub cluster_id: ClusterId,
    #[serde(flatten)]
    pub stats: WorkerStats,
}

impl ClusterStats {
    fn add(&mut self, cluster_id: ClusterId, stats: WorkerStats) {
        self.guilds += stats.guilds;
        self.users += stats.users;
        self.voice += stats.voice;
        self.large_guilds += stats.large_guilds;
        self.exclusive_guilds += stats.exclusive_guilds;
        self.total_memory_bytes += stats.memory_bytes;
        self.clusters.push(ClusterStatsEntry { cluster_id, stats });
    }
}

#[derive(Debug, Default)]
pub struct StatsAggregator {
    round: RoundId,
    expected: usize,
    reported: HashSet<ClusterId>,
    accumulator: ClusterStats,
    open: bool,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the accumulator and open a round expecting `expected` reports.
    /// A round with nothing to wait for is closed immediately.
    pub fn begin_round(&mut self, expected: usize) -> RoundId {
        self.round += 1;
        self.expected = expected;
        self.reported.clear();
        self.accumulator = ClusterStats::default();
        self.open = expected > 0;
        self.round
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Add one report. Returns the finished aggregate when this report
    /// completes the round.
    pub fn record(&mut self, round: RoundId, cluster_id: ClusterId, stats: WorkerStats) -> Option<ClusterStats> {
        if !self.open || round != self.round {
            debug!(round, current = self.round, cluster_id, "Dropping stats report outside the open round");
            return None;
        }
        if !self.reported.insert(cluster_id) {
            debug!(round, cluster_id, "Dropping duplicate stats report");
            return None;
        }

        self.accumulator.add(cluster_id, stats);

        if self.reported.len() < self.expected {
            return None;
        }

        self.open = false;
        let mut aggregate = std::mem::take(&mut self.accumulator);
        aggregate.clusters.sort_by_key(|c| c.cluster_id);
        Some(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(guilds: u64) -> WorkerStats {
        WorkerStats {
            guilds,
            users: guilds * 10,
            memory_bytes: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn publishes_once_all_reports_arrive() {
        let mut agg = StatsAggregator::new();
        let round = agg.begin_round(3);

        assert!(agg.record(round, 2, stats(5)).is_none());
        assert!(agg.record(round, 0, stats(1)).is_none());
        let result = agg.record(round, 1, stats(2)).expect("round complete");

        assert_eq!(result.guilds, 8);
        assert_eq!(result.users, 80);
        assert_eq!(result.total_memory_bytes, 3072);
        let order: Vec<ClusterId> = result.clusters.iter().map(|c| c.cluster_id).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(!agg.is_open());
    }

    #[test]
    fn late_and_stale_reports_are_dropped() {
        let mut agg = StatsAggregator::new();
        let first = agg.begin_round(1);
        assert!(agg.record(first, 0, stats(1)).is_some());
        assert!(agg.record(first, 1, stats(1)).is_none());

        let second = agg.begin_round(2);
        assert!(agg.record(first, 0, stats(1)).is_none());
        assert!(agg.record(second, 0, stats(1)).is_none());
        assert!(agg.record(second, 0, stats(1)).is_none(), "duplicate ignored");
        assert!(agg.record(second, 1, stats(1)).is_some());
    }

    #[test]
    fn empty_round_is_closed() {
        let mut agg = StatsAggregator::new();
        let round = agg.begin_round(0);
        assert!(!agg.is_open());
        assert!(agg.record(round, 0, stats(1)).is_none());
    }
}
