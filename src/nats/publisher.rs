//! NATS stats publisher
//!
//! Publishes each completed fleet stats aggregate to JetStream.

use crate::error::FleetError;
use crate::manager::stats::ClusterStats;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::connection::State;
use async_nats::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Stream name for fleet telemetry
pub const STREAM: &str = "FLEET";

/// Subjects published by the manager
pub mod subjects {
    /// Aggregated fleet stats, one message per stats round
    pub const STATS: &str = "fleet.stats";
}

/// NATS publisher for fleet telemetry
pub struct NatsPublisher {
    client: Client,
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server(s), comma-separated
    pub async fn connect(servers: &str) -> Result<Arc<Self>, FleetError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| FleetError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client.clone());
        ensure_stream(&jetstream).await?;

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish one stats aggregate
    pub async fn publish_stats(&self, stats: &ClusterStats) -> Result<(), FleetError> {
        let payload = serde_json::to_vec(stats).map_err(FleetError::Codec)?;

        match self.jetstream.publish(subjects::STATS, payload.into()).await {
            Ok(ack) => {
                let ack = ack.await.map_err(|e| self.failed(Box::new(e)))?;
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(subject = subjects::STATS, seq = ack.sequence, "Stats published");
                Ok(())
            }
            Err(e) => Err(self.failed(Box::new(e))),
        }
    }

    fn failed(&self, source: Box<dyn std::error::Error + Send + Sync>) -> FleetError {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        warn!(subject = subjects::STATS, error = %source, "Failed to publish stats");
        FleetError::NatsPublishFailed {
            subject: subjects::STATS.to_string(),
            source,
        }
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        // Publishes spawned by the last stats round may still be buffered
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
    }
}

/// Ensure the telemetry stream exists
async fn ensure_stream(js: &JsContext) -> Result<(), FleetError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    // Memory storage, one hour of stats history
    let config = Config {
        name: STREAM.to_string(),
        subjects: vec!["fleet.>".to_string()],
        retention: RetentionPolicy::Limits,
        max_age: std::time::Duration::from_secs(3600),
        storage: StorageType::Memory,
        ..Default::default()
    };

    match js.get_or_create_stream(config).await {
        Ok(_) => {
            info!(stream = STREAM, "NATS stream configured");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, stream = STREAM, "Failed to create NATS stream");
            Err(FleetError::NatsConnectionFailed(Box::new(e)))
        }
    }
}
