//! Manager ↔ worker IPC
//!
//! Structured envelopes plus the NDJSON framing that carries them over the
//! worker's stdin/stdout.

pub mod envelope;
pub mod transport;

pub use envelope::{
    ClientOptions, ClusterId, ConnectDirective, EntityKind, FetchRequest, FetchResponse, LogLevel,
    ManagerMessage, RoundId, ShardStatus, WorkerMessage, WorkerStats,
};

/// Exit code a worker uses when it stops because the manager asked it to.
/// The manager replaces it like any other exit but logs it as requested.
pub const RESTART_EXIT_CODE: i32 = 75;
