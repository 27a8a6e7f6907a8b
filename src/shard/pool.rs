//! Shard pool implementation
//!
//! Runs the contiguous shard range of one worker, one task per shard.
//! Lifecycle transitions are reported to the worker supervisor as
//! [`ShardEvent`]s; every gateway event also feeds the entity cache.

use crate::error::FleetError;
use crate::ipc::{ClientOptions, ClusterId, ConnectDirective};
use crate::shard::partition::ShardRange;
use crate::shard::state::{ShardHealth, ShardState};
use crate::worker::cache::EntityCache;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use twilight_gateway::{ConfigBuilder, EventTypeFlags, Intents, Shard, StreamExt as _};
use twilight_model::gateway::event::Event;
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::presence::{ActivityType, MinimalActivity, Status};
use twilight_model::gateway::ShardId;

/// Consecutive receive errors after which a shard is given up
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Shard lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    /// Gateway hello received, identifying or resuming
    Connected { shard_id: u32 },
    Ready { shard_id: u32, guilds: usize },
    Resumed { shard_id: u32 },
    Disconnected { shard_id: u32, reason: String },
    /// Transient receive error; twilight reconnects on its own
    Warning { shard_id: u32, message: String },
    /// Circuit breaker tripped or reconnect failed
    Dead { shard_id: u32, error: String },
    /// Every shard task has returned
    Stopped,
}

/// Shard pool managing the shards of one cluster
pub struct ShardPool {
    cluster_id: ClusterId,
    range: ShardRange,
    shards: Vec<Shard>,
    state: ShardState,
    cache: EntityCache,
    events: mpsc::UnboundedSender<ShardEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ShardPool {
    /// Create the shards named by a connect directive
    pub fn new(
        directive: &ConnectDirective,
        state: ShardState,
        cache: EntityCache,
        events: mpsc::UnboundedSender<ShardEvent>,
    ) -> Result<Self, FleetError> {
        let range = directive.range();
        if range.last >= directive.max_shards {
            return Err(FleetError::Config(format!(
                "shard range {range} exceeds {} total shards",
                directive.max_shards
            )));
        }

        crate::install_crypto_provider();
        let intents = intents(&directive.client_options);
        info!(
            cluster_id = directive.cluster_id,
            shards = %range,
            total_shards = directive.max_shards,
            ?intents,
            "Creating shard pool"
        );

        let mut shards = Vec::with_capacity(range.len() as usize);
        for shard_id in range.iter() {
            let mut config = ConfigBuilder::new(directive.token.clone(), intents);

            if let Some(threshold) = directive.client_options.large_threshold {
                config = config.large_threshold(threshold.clamp(50, 250));
            }
            if let Some(label) = &directive.presence {
                match presence(label, shard_id) {
                    Some(payload) => config = config.presence(payload),
                    None => warn!(shard_id, "Invalid presence, identifying without one"),
                }
            }

            shards.push(Shard::with_config(
                ShardId::new(shard_id, directive.max_shards),
                config.build(),
            ));
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            cluster_id: directive.cluster_id,
            range,
            shards,
            state,
            cache,
            events,
            shutdown_tx,
        })
    }

    /// Get shared state
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    /// Sender that stops every shard task of this pool
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run all shards in the pool
    ///
    /// Spawns a task per shard and returns once all of them have ended,
    /// reporting [`ShardEvent::Stopped`].
    pub async fn run(self) {
        let mut handles = Vec::with_capacity(self.shards.len());

        for shard in self.shards {
            let shard_id = shard.id().number();
            let state = self.state.clone();
            let cache = self.cache.clone();
            let events = self.events.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                tokio::select! {
                    result = run_shard(shard, state, cache, events.clone()) => {
                        if let Err(e) = result {
                            error!(shard_id, error = %e, "Shard task failed");
                            let _ = events.send(ShardEvent::Dead { shard_id, error: e.to_string() });
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(shard_id, "Shard received shutdown signal");
                    }
                }
            });

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!(cluster_id = self.cluster_id, shards = %self.range, "Shard pool shut down");
        let _ = self.events.send(ShardEvent::Stopped);
    }
}

/// Intents from the client options, or the defaults the cache needs.
///
/// GUILDS and GUILD_MEMBERS feed the entity cache, GUILD_VOICE_STATES feeds
/// the voice session count.
pub fn intents(options: &ClientOptions) -> Intents {
    options
        .intents
        .map(Intents::from_bits_truncate)
        .unwrap_or_else(|| Intents::GUILDS | Intents::GUILD_MEMBERS | Intents::GUILD_VOICE_STATES)
}

/// Activity shown by `shard_id`: `"{label} | Shard {id}"`
pub fn presence(label: &str, shard_id: u32) -> Option<UpdatePresencePayload> {
    let activity = MinimalActivity {
        kind: ActivityType::Playing,
        name: format!("{label} | Shard {shard_id}"),
        url: None,
    };
    UpdatePresencePayload::new(vec![activity.into()], false, None, Status::Online).ok()
}

/// Run a single shard's event loop
async fn run_shard(
    mut shard: Shard,
    state: ShardState,
    cache: EntityCache,
    events: mpsc::UnboundedSender<ShardEvent>,
) -> Result<(), FleetError> {
    let shard_id = shard.id().number();

    state.set_health(shard_id, ShardHealth::Connecting);
    debug!(shard_id, "Shard starting");

    let mut consecutive_errors: u32 = 0;

    while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
        let event = match item {
            Ok(event) => {
                consecutive_errors = 0;
                event
            }
            Err(source) => {
                consecutive_errors += 1;

                // Immediate fatal: reconnect failure
                if matches!(source.kind(), twilight_gateway::error::ReceiveMessageErrorType::Reconnect) {
                    state.set_health(shard_id, ShardHealth::Dead);
                    return Err(FleetError::ShardReconnectFailed {
                        shard_id,
                        source: Box::new(source),
                    });
                }

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    state.set_health(shard_id, ShardHealth::Dead);
                    return Err(FleetError::ShardCircuitBroken {
                        shard_id,
                        count: consecutive_errors,
                        max: MAX_CONSECUTIVE_ERRORS,
                    });
                }

                // Health is left alone; twilight reconnects on its own and the
                // Hello/Resumed that follows moves the shard
                let _ = events.send(ShardEvent::Warning {
                    shard_id,
                    message: format!("{source} ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS})"),
                });
                continue;
            }
        };

        state.record_event(shard_id);
        cache.update(shard_id, &event);

        let transition = match &event {
            Event::GatewayHello(_) => {
                state.set_health(shard_id, ShardHealth::Connecting);
                Some(ShardEvent::Connected { shard_id })
            }
            Event::Ready(ready) => {
                state.set_health(shard_id, ShardHealth::Ready);
                Some(ShardEvent::Ready {
                    shard_id,
                    guilds: ready.guilds.len(),
                })
            }
            Event::Resumed => {
                state.set_health(shard_id, ShardHealth::Ready);
                Some(ShardEvent::Resumed { shard_id })
            }
            Event::GatewayHeartbeatAck => {
                state.record_heartbeat(shard_id, shard.latency().average());
                None
            }
            Event::GatewayReconnect => {
                state.set_health(shard_id, ShardHealth::Resuming);
                Some(ShardEvent::Disconnected {
                    shard_id,
                    reason: "reconnect requested by gateway".to_string(),
                })
            }
            Event::GatewayInvalidateSession(resumable) => {
                state.set_health(shard_id, ShardHealth::Disconnected);
                Some(ShardEvent::Disconnected {
                    shard_id,
                    reason: format!("session invalidated (resumable: {resumable})"),
                })
            }
            Event::GatewayClose(_) => {
                state.set_health(shard_id, ShardHealth::Disconnected);
                Some(ShardEvent::Disconnected {
                    shard_id,
                    reason: "connection closed".to_string(),
                })
            }
            _ => None,
        };

        if let Some(transition) = transition {
            let _ = events.send(transition);
        }
    }

    info!(shard_id, "Shard event stream ended");
    Ok(())
}
