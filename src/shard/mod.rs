//! Shard management module
//!
//! Range partitioning for the manager; pool and per-shard state for workers.

pub mod partition;
mod pool;
mod state;

pub use partition::{partition, partition_range, ShardRange};
pub use pool::{intents, presence, ShardEvent, ShardPool, MAX_CONSECUTIVE_ERRORS};
pub use state::{ShardHealth, ShardState};
