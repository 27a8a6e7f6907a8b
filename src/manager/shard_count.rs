//! Total shard count resolution
//!
//! Either configured explicitly or derived from Discord's recommendation
//! (`GET /gateway/bot`), rescaled to the configured guilds-per-shard budget.

use crate::error::FleetError;
use std::future::Future;
use tracing::info;

/// Guilds per shard Discord assumes when recommending a shard count
pub const DISCORD_GUILDS_PER_SHARD: u64 = 1000;

/// Source of the gateway's recommended shard count
pub trait RecommendedShards {
    fn recommended_shards(&self) -> impl Future<Output = Result<u32, FleetError>> + Send;
}

impl RecommendedShards for twilight_http::Client {
    fn recommended_shards(&self) -> impl Future<Output = Result<u32, FleetError>> + Send {
        async move {
            let info = self
                .gateway()
                .authed()
                .await
                .map_err(|e| FleetError::ShardCountQuery(Box::new(e)))?
                .model()
                .await
                .map_err(|e| FleetError::ShardCountQuery(Box::new(e)))?;
            Ok(info.shards)
        }
    }
}

/// Rescale Discord's recommendation to `guilds_per_shard`.
///
/// A single recommended shard stays a single shard.
pub fn scale_recommended(recommended: u32, guilds_per_shard: u32) -> u32 {
    if recommended <= 1 || guilds_per_shard == 0 {
        return recommended.max(1);
    }
    let guilds = u64::from(recommended) * DISCORD_GUILDS_PER_SHARD;
    let shards = guilds.div_ceil(u64::from(guilds_per_shard));
    u32::try_from(shards).unwrap_or(u32::MAX)
}

/// Resolve the fleet's total shard count; `configured == 0` means automatic
pub async fn resolve_shard_count<S: RecommendedShards>(
    configured: u32,
    guilds_per_shard: u32,
    source: &S,
) -> Result<u32, FleetError> {
    if configured != 0 {
        return Ok(configured);
    }

    let recommended = source.recommended_shards().await?;
    let shards = scale_recommended(recommended, guilds_per_shard);
    info!(recommended, guilds_per_shard, shards, "Resolved shard count from gateway");
    Ok(shards)
}
