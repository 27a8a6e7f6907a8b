//! Shard partitioning across worker processes
//!
//! Splits a contiguous shard interval into per-cluster ranges. When the
//! interval does not divide evenly, earlier clusters take one extra shard.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive, contiguous range of shard ids owned by one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    pub first: u32,
    pub last: u32,
}

impl ShardRange {
    pub fn new(first: u32, last: u32) -> Self {
        debug_assert!(first <= last, "shard range must not be inverted");
        Self { first, last }
    }

    /// Number of shards in the range
    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Ranges are never empty; kept for clippy's len_without_is_empty
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, shard_id: u32) -> bool {
        (self.first..=self.last).contains(&shard_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.first..=self.last
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

/// Partition `[0, total_shards)` into at most `worker_count` ranges.
///
/// Returns an empty vector when `total_shards` is zero.
pub fn partition(total_shards: u32, worker_count: u32) -> Vec<ShardRange> {
    if total_shards == 0 {
        return Vec::new();
    }
    partition_range(0, total_shards - 1, worker_count)
}

/// Partition the inclusive interval `[first, last]` into at most
/// `worker_count` contiguous ranges whose sizes differ by at most one.
///
/// Only non-empty ranges are returned, so asking for more workers than there
/// are shards yields one single-shard range per shard.
pub fn partition_range(first: u32, last: u32, worker_count: u32) -> Vec<ShardRange> {
    if first > last {
        return Vec::new();
    }

    if worker_count < 2 {
        return vec![ShardRange::new(first, last)];
    }

    let len = last - first + 1;
    let mut out = Vec::with_capacity(worker_count.min(len) as usize);

    if len % worker_count == 0 {
        let size = len / worker_count;
        let mut start = first;
        for _ in 0..worker_count {
            out.push(ShardRange::new(start, start + size - 1));
            start += size;
        }
        return out;
    }

    // Remainder-first greedy split
    let mut offset = 0u32;
    let mut remaining_workers = worker_count;
    while offset < len {
        let remaining = len - offset;
        let size = remaining.div_ceil(remaining_workers);
        let start = first + offset;
        out.push(ShardRange::new(start, start + size - 1));
        offset += size;
        remaining_workers -= 1;
    }

    out
}
