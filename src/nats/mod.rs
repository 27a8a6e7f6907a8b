//! NATS JetStream integration
//!
//! Optional sink for aggregated fleet stats.

mod publisher;

pub use publisher::{subjects, NatsPublisher, STREAM};
