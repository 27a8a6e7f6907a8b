//! Envelopes exchanged between the manager and its worker processes
//!
//! Both directions are internally tagged JSON objects with a kebab-case
//! `type` field, one object per line.

use crate::notify::Notification;
use crate::shard::{ShardHealth, ShardRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Stable logical index of a worker; survives restarts
pub type ClusterId = u32;

/// Identifier of one telemetry aggregation round
pub type RoundId = u64;

/// Messages sent by the manager to a worker (worker stdin)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ManagerMessage {
    Connect(ConnectDirective),
    StatsRequest { round: RoundId },
    FetchRequest(FetchRequest),
    FetchResponse(FetchResponse),
    RestartRequest,
    Broadcast { payload: Value },
    DirectSend { cluster_id: ClusterId, payload: Value },
}

/// Messages sent by a worker to the manager (worker stdout)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Every shard of the worker is ready; advances the startup queue
    ShardsStarted,
    /// `round` is `None` for the sampler's unsolicited reports
    StatsReport {
        round: Option<RoundId>,
        stats: WorkerStats,
    },
    FetchRequest(FetchRequest),
    FetchResponse(FetchResponse),
    LifecycleLog { level: LogLevel, message: String },
    Notify { notification: Notification },
    Broadcast { payload: Value },
    DirectSend { cluster_id: ClusterId, payload: Value },
}

impl WorkerMessage {
    /// Short kind label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShardsStarted => "shards-started",
            Self::StatsReport { .. } => "stats-report",
            Self::FetchRequest(_) => "fetch-request",
            Self::FetchResponse(_) => "fetch-response",
            Self::LifecycleLog { .. } => "lifecycle-log",
            Self::Notify { .. } => "notify",
            Self::Broadcast { .. } => "broadcast",
            Self::DirectSend { .. } => "direct-send",
        }
    }
}

/// Directive telling a freshly spawned worker which shards to run
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectDirective {
    pub cluster_id: ClusterId,
    pub first_shard_id: u32,
    pub last_shard_id: u32,
    pub max_shards: u32,
    pub token: String,
    #[serde(default)]
    pub client_options: ClientOptions,
    pub cluster_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl ConnectDirective {
    pub fn range(&self) -> ShardRange {
        ShardRange::new(self.first_shard_id, self.last_shard_id)
    }
}

// The token never reaches a log line
impl fmt::Debug for ConnectDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectDirective")
            .field("cluster_id", &self.cluster_id)
            .field("first_shard_id", &self.first_shard_id)
            .field("last_shard_id", &self.last_shard_id)
            .field("max_shards", &self.max_shards)
            .field("token", &"<redacted>")
            .field("client_options", &self.client_options)
            .field("cluster_count", &self.cluster_count)
            .field("presence", &self.presence)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

/// Gateway client options passed through to every worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Raw gateway intents bitfield; defaults to GUILDS | GUILD_MEMBERS | GUILD_VOICE_STATES
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,
    /// Member count above which a guild counts as large (50..=250)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u64>,
}

/// Kind of entity that can be looked up across workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Guild,
    Channel,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Guild => "guild",
            Self::Channel => "channel",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub request_id: Uuid,
    pub kind: EntityKind,
    pub id: u64,
}

/// `value` is `None` when the manager expired the request unanswered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub request_id: Uuid,
    pub id: u64,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// Telemetry snapshot of one worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub guilds: u64,
    pub users: u64,
    pub voice: u64,
    pub large_guilds: u64,
    pub exclusive_guilds: u64,
    pub memory_bytes: u64,
    pub uptime_ms: u64,
    pub shard_count: u32,
    #[serde(default)]
    pub events_received: u64,
    #[serde(default)]
    pub shards: Vec<ShardStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub id: u32,
    pub ready: bool,
    pub latency_ms: Option<u64>,
    pub status: ShardHealth,
}
