//! Worker process
//!
//! A worker waits for one `connect` directive on stdin, runs the shard pool
//! for its range and answers the manager until it is told to restart or its
//! shards all die. It never writes anything but envelopes to stdout.

pub mod app;
pub mod cache;
pub mod telemetry;

pub use app::{Application, ClusterHandle, ClusterLogger, LaunchContext};
pub use cache::{CacheCounts, CachedChannel, CachedGuild, CachedUser, EntityCache};
pub use telemetry::TelemetrySampler;

use crate::config::DEFAULT_WORKER_STATS_INTERVAL_MS;
use crate::error::FleetError;
use crate::ipc::transport::{read_messages, write_messages};
use crate::ipc::{
    ClusterId, ConnectDirective, FetchResponse, ManagerMessage, RoundId, WorkerMessage,
    RESTART_EXIT_CODE,
};
use crate::manager::spawner::CLUSTER_ID_ENV;
use crate::notify::{colors, Notification};
use crate::shard::{ShardEvent, ShardHealth, ShardPool, ShardState};
use app::FetchWaiters;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Exit code when the worker gives up on its own
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Time given to the stdout writer to drain before the process exits
const EXIT_FLUSH: Duration = Duration::from_millis(500);

pub struct WorkerSupervisor<A: Application> {
    cluster_id: ClusterId,
    app: Arc<A>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    cache: EntityCache,
    waiters: FetchWaiters,
    sampler: TelemetrySampler,
    stats_interval: Duration,
    directive: Option<ConnectDirective>,
    state: Option<ShardState>,
    pool_shutdown: Option<broadcast::Sender<()>>,
    shard_tx: mpsc::UnboundedSender<ShardEvent>,
    shard_rx: mpsc::UnboundedReceiver<ShardEvent>,
    launch_tx: mpsc::UnboundedSender<FleetError>,
    launch_rx: mpsc::UnboundedReceiver<FleetError>,
    all_ready: bool,
    launched: bool,
}

impl<A: Application> WorkerSupervisor<A> {
    pub fn new(
        cluster_id: ClusterId,
        app: A,
        outbound: mpsc::UnboundedSender<WorkerMessage>,
        stats_interval: Duration,
    ) -> Self {
        crate::install_crypto_provider();
        let (shard_tx, shard_rx) = mpsc::unbounded_channel();
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();

        Self {
            cluster_id,
            app: Arc::new(app),
            outbound,
            cache: EntityCache::new(),
            waiters: FetchWaiters::default(),
            sampler: TelemetrySampler::new(),
            stats_interval: stats_interval.max(Duration::from_millis(1)),
            directive: None,
            state: None,
            pool_shutdown: None,
            shard_tx,
            shard_rx,
            launch_tx,
            launch_rx,
            all_ready: false,
            launched: false,
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Handle manager messages and shard events until the worker should
    /// exit. Returns the exit code.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<ManagerMessage>) -> i32 {
        let mut sampler = tokio::time::interval(self.stats_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let code = loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        if let Some(code) = self.handle_message(message) {
                            break code;
                        }
                    }
                    None => {
                        info!(cluster_id = self.cluster_id, "Manager closed the IPC channel");
                        break 0;
                    }
                },
                Some(event) = self.shard_rx.recv() => {
                    if let Some(code) = self.on_shard_event(event) {
                        break code;
                    }
                }
                Some(e) = self.launch_rx.recv() => {
                    error!(cluster_id = self.cluster_id, error = %e, "Application bootstrap failed");
                    break FAILURE_EXIT_CODE;
                }
                _ = sampler.tick(), if self.launched => self.send_stats(None),
            }
        };

        if let Some(shutdown) = &self.pool_shutdown {
            let _ = shutdown.send(());
        }
        code
    }

    /// React to one manager message; `Some(code)` ends the worker
    pub fn handle_message(&mut self, message: ManagerMessage) -> Option<i32> {
        match message {
            ManagerMessage::Connect(directive) => self.connect(directive),
            ManagerMessage::StatsRequest { round } => self.send_stats(Some(round)),
            ManagerMessage::FetchRequest(request) => {
                if let Some(value) = self.cache.lookup(request.kind, request.id) {
                    self.send(WorkerMessage::FetchResponse(FetchResponse {
                        request_id: request.request_id,
                        id: request.id,
                        value: Some(value),
                    }));
                }
            }
            ManagerMessage::FetchResponse(response) => match self.waiters.remove(&response.request_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response.value);
                }
                None => debug!(request_id = %response.request_id, "No local waiter for fetch response"),
            },
            ManagerMessage::RestartRequest => {
                info!(cluster_id = self.cluster_id, "Restart requested, exiting");
                return Some(RESTART_EXIT_CODE);
            }
            ManagerMessage::Broadcast { payload } => self.app.on_message(None, payload),
            ManagerMessage::DirectSend { cluster_id, payload } => self.app.on_message(Some(cluster_id), payload),
        }
        None
    }

    fn connect(&mut self, directive: ConnectDirective) {
        if self.directive.is_some() {
            warn!(cluster_id = self.cluster_id, "Ignoring repeated connect directive");
            return;
        }

        self.cluster_id = directive.cluster_id;
        let range = directive.range();
        let state = ShardState::new(range.iter());
        self.state = Some(state.clone());

        if directive.dry_run {
            info!(cluster_id = self.cluster_id, shards = %range, "Dry run, skipping gateway connection");
            for shard_id in range.iter() {
                state.set_health(shard_id, ShardHealth::Ready);
            }
            self.directive = Some(directive);
            self.check_all_ready();
            return;
        }

        match ShardPool::new(&directive, state, self.cache.clone(), self.shard_tx.clone()) {
            Ok(pool) => {
                self.pool_shutdown = Some(pool.shutdown_handle());
                tokio::spawn(pool.run());
                info!(cluster_id = self.cluster_id, shards = %range, "Connecting shards");
            }
            Err(e) => {
                error!(cluster_id = self.cluster_id, error = %e, "Failed to create shard pool");
                let _ = self.launch_tx.send(e);
            }
        }
        self.directive = Some(directive);
    }

    fn on_shard_event(&mut self, event: ShardEvent) -> Option<i32> {
        let cluster_id = self.cluster_id;
        match event {
            ShardEvent::Connected { shard_id } => {
                info!(cluster_id, shard_id, "Shard connected");
                self.shard_notice(colors::YELLOW, shard_id, "Connected");
            }
            ShardEvent::Ready { shard_id, guilds } => {
                info!(cluster_id, shard_id, guilds, "Shard ready");
                self.shard_notice(colors::GREEN, shard_id, "Ready");
                self.check_all_ready();
            }
            ShardEvent::Resumed { shard_id } => {
                info!(cluster_id, shard_id, "Shard resumed");
                self.shard_notice(colors::GREEN, shard_id, "Resumed");
                self.check_all_ready();
            }
            ShardEvent::Disconnected { shard_id, reason } => {
                warn!(cluster_id, shard_id, reason = %reason, "Shard disconnected");
                self.refresh_all_ready();
                self.send(WorkerMessage::Notify {
                    notification: Notification::new(colors::RED, shard_title(cluster_id, shard_id), "Disconnected")
                        .with_code_field("Reason", &reason),
                });
            }
            ShardEvent::Warning { shard_id, message } => {
                warn!(cluster_id, shard_id, warning = %message, "Shard has received a warning");
                self.send(WorkerMessage::Notify {
                    notification: Notification::new(colors::YELLOW, shard_title(cluster_id, shard_id), "Warning")
                        .with_code_field("Warning", &message),
                });
            }
            ShardEvent::Dead { shard_id, error } => {
                error!(cluster_id, shard_id, error = %error, "Shard has encountered an error");
                self.refresh_all_ready();
                self.send(WorkerMessage::Notify {
                    notification: Notification::new(colors::RED, shard_title(cluster_id, shard_id), "Error")
                        .with_code_field("Error", &error),
                });
            }
            ShardEvent::Stopped => {
                error!(cluster_id, "Every shard has stopped, exiting");
                return Some(FAILURE_EXIT_CODE);
            }
        }
        None
    }

    fn shard_notice(&self, color: u32, shard_id: u32, description: &str) {
        self.send(WorkerMessage::Notify {
            notification: Notification::new(color, shard_title(self.cluster_id, shard_id), description),
        });
    }

    /// Forget the all-ready announcement once a shard has left `Ready`
    fn refresh_all_ready(&mut self) {
        if !self.state.as_ref().is_some_and(ShardState::all_ready) {
            self.all_ready = false;
        }
    }

    /// Announce every transition into all-shards-ready; launch the
    /// application on the first one
    fn check_all_ready(&mut self) {
        let ready = self.state.as_ref().is_some_and(ShardState::all_ready);
        if !ready || self.all_ready {
            return;
        }

        self.all_ready = true;
        info!(cluster_id = self.cluster_id, "All shards ready");
        self.send(WorkerMessage::ShardsStarted);

        if !self.launched {
            self.launch();
        }
    }

    fn launch(&mut self) {
        let Some(directive) = &self.directive else {
            return;
        };
        self.launched = true;

        let ctx = LaunchContext {
            cluster_id: directive.cluster_id,
            cluster_count: directive.cluster_count,
            shards: directive.range(),
            total_shards: directive.max_shards,
            cache: self.cache.clone(),
            http: Arc::new(twilight_http::Client::new(directive.token.clone())),
            cluster: ClusterHandle::new(
                directive.cluster_id,
                self.outbound.clone(),
                self.cache.clone(),
                Arc::clone(&self.waiters),
            ),
            logger: ClusterLogger::new(self.outbound.clone()),
        };

        let app = Arc::clone(&self.app);
        let failures = self.launch_tx.clone();
        let cluster_id = directive.cluster_id;
        tokio::spawn(async move {
            if let Err(e) = app.on_launch(ctx).await {
                let e = match e {
                    FleetError::Bootstrap { .. } => e,
                    other => FleetError::Bootstrap {
                        cluster_id,
                        reason: other.to_string(),
                    },
                };
                let _ = failures.send(e);
            }
        });
        info!(cluster_id = self.cluster_id, "Application launched");
    }

    fn send_stats(&mut self, round: Option<RoundId>) {
        let state = self
            .state
            .clone()
            .unwrap_or_else(|| ShardState::new(std::iter::empty()));
        let stats = self.sampler.sample(&self.cache, &state);
        self.send(WorkerMessage::StatsReport { round, stats });
    }

    fn send(&self, message: WorkerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(cluster_id = self.cluster_id, "IPC writer gone, dropping message");
        }
    }
}

fn shard_title(cluster_id: ClusterId, shard_id: u32) -> String {
    format!("Cluster {cluster_id} · Shard {shard_id}")
}

/// Worker process entry point: wire stdin/stdout, run the supervisor and
/// return the exit code.
pub async fn run<A: Application>(app: A) -> Result<i32, FleetError> {
    let cluster_id: ClusterId = std::env::var(CLUSTER_ID_ENV)
        .ok()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0);
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let stats_interval = std::env::var("FLEET_WORKER_STATS_INTERVAL_MS")
        .ok()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(DEFAULT_WORKER_STATS_INTERVAL_MS);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    crate::logging::init_worker(&level, &outbound_tx)?;

    let writer = tokio::spawn(write_messages(tokio::io::stdout(), outbound_rx));

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ManagerMessage>();
    tokio::spawn(async move {
        let result = read_messages(tokio::io::stdin(), |message| {
            let _ = inbound_tx.send(message);
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to read from manager");
        }
    });

    info!(cluster_id, "Worker started");
    let supervisor = WorkerSupervisor::new(
        cluster_id,
        app,
        outbound_tx,
        Duration::from_millis(stats_interval),
    );
    let code = supervisor.run(inbound_rx).await;

    // Application tasks may still hold senders; give queued lines a moment
    let _ = tokio::time::timeout(EXIT_FLUSH, writer).await;
    Ok(code)
}
