//! Cluster manager
//!
//! Owns the worker registry, the startup queue, the fetch bridge and the
//! stats aggregator, and drives all of them from one `tokio::select!` loop:
//!
//! ```text
//! worker pipes ──► ManagerEvent ──┐
//! startup queue ──► dispatch ─────┤
//! stats timer ──► stats-request ──┼──► ClusterManager ──► workers / webhook / NATS
//! maintenance timer ──────────────┤
//! HTTP control ──► ControlCommand ┘
//! ```
//!
//! Nothing here is shared; handlers run to completion one event at a time,
//! so the handle index is swapped inside a single handler on restart.

pub mod fetch;
pub mod record;
pub mod shard_count;
pub mod spawner;
pub mod stats;

pub use fetch::FetchBridge;
pub use record::{Registry, WorkerHandle, WorkerRecord, WorkerState, WorkerSummary};
pub use shard_count::{resolve_shard_count, RecommendedShards};
pub use spawner::{ProcessSpawner, WorkerLink, WorkerSpawner};
pub use stats::{ClusterStats, StatsAggregator};

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::ipc::{
    ClusterId, ConnectDirective, FetchResponse, LogLevel, ManagerMessage, RoundId, WorkerMessage,
    WorkerStats, RESTART_EXIT_CODE,
};
use crate::metrics::FleetMetrics;
use crate::nats::NatsPublisher;
use crate::notify::{colors, DisabledNotifier, Notification, Notifier};
use crate::queue::{QueueItem, StartupQueue};
use crate::shard::{partition_range, ShardRange};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Period of the fetch expiry and respawn sweep
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the manager reacts to besides its own timers
#[derive(Debug)]
pub enum ManagerEvent {
    Message {
        handle: WorkerHandle,
        message: WorkerMessage,
    },
    /// The worker's stdout reached EOF
    Disconnected { handle: WorkerHandle },
    Exited {
        handle: WorkerHandle,
        code: Option<i32>,
    },
    Control(ControlCommand),
}

/// Operator commands from the HTTP surface
#[derive(Debug)]
pub enum ControlCommand {
    /// Ask a worker to exit so it gets replaced; replies whether the
    /// request reached a live worker
    Restart {
        cluster_id: ClusterId,
        reply: oneshot::Sender<bool>,
    },
}

/// Snapshot of the fleet, refreshed after every handled event
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetStatus {
    /// Every cluster has reported its shards ready at least once
    pub started: bool,
    pub total_shards: u32,
    pub cluster_count: u32,
    pub queue_depth: usize,
    pub pending_fetches: usize,
    pub clusters: Vec<WorkerSummary>,
}

impl FleetStatus {
    pub fn ready_clusters(&self) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.state == WorkerState::Ready)
            .count()
    }

    pub fn all_ready(&self) -> bool {
        !self.clusters.is_empty() && self.ready_clusters() == self.clusters.len()
    }
}

/// Cloneable sender for operator commands
#[derive(Debug, Clone)]
pub struct ManagerControl {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ManagerControl {
    /// Request a restart of `cluster_id`. `Ok(false)` when no live worker
    /// runs that cluster.
    pub async fn restart(&self, cluster_id: ClusterId) -> Result<bool, FleetError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerEvent::Control(ControlCommand::Restart { cluster_id, reply }))
            .map_err(|_| FleetError::ChannelClosed { cluster_id })?;
        rx.await.map_err(|_| FleetError::ChannelClosed { cluster_id })
    }
}

pub struct ClusterManager {
    config: FleetConfig,
    spawner: Box<dyn WorkerSpawner>,
    notifier: Arc<dyn Notifier>,
    nats: Option<Arc<NatsPublisher>>,
    metrics: FleetMetrics,
    registry: Registry,
    queue: StartupQueue<ClusterId, ManagerMessage>,
    fetches: FetchBridge,
    stats: StatsAggregator,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    status_tx: watch::Sender<FleetStatus>,
    stats_tx: watch::Sender<Option<ClusterStats>>,
    next_handle: u64,
    running: bool,
    announced: bool,
    total_shards: u32,
    cluster_count: u32,
}

impl ClusterManager {
    pub fn new(config: FleetConfig, spawner: impl WorkerSpawner + 'static) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(FleetStatus::default());
        let (stats_tx, _) = watch::channel(None);

        Self {
            queue: StartupQueue::new(config.startup_cooldown, config.queue_timeout),
            fetches: FetchBridge::new(config.fetch_timeout),
            config,
            spawner: Box::new(spawner),
            notifier: Arc::new(DisabledNotifier),
            nats: None,
            metrics: FleetMetrics::detached(),
            registry: Registry::new(),
            stats: StatsAggregator::new(),
            events_tx,
            events_rx,
            status_tx,
            stats_tx,
            next_handle: 0,
            running: false,
            announced: false,
            total_shards: 0,
            cluster_count: 0,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_nats(mut self, nats: Option<Arc<NatsPublisher>>) -> Self {
        self.nats = nats;
        self
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn control(&self) -> ManagerControl {
        ManagerControl {
            tx: self.events_tx.clone(),
        }
    }

    pub fn status(&self) -> watch::Receiver<FleetStatus> {
        self.status_tx.subscribe()
    }

    /// Last completed stats aggregate
    pub fn stats(&self) -> watch::Receiver<Option<ClusterStats>> {
        self.stats_tx.subscribe()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Cluster whose connect directive awaits `shards-started`
    pub fn in_flight(&self) -> Option<ClusterId> {
        self.queue.in_flight().copied()
    }

    pub fn pending_fetches(&self) -> usize {
        self.fetches.len()
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Partition `total_shards` and launch one worker per range, in
    /// ascending cluster id order. Returns the ranges.
    pub fn start(&mut self, total_shards: u32) -> Result<Vec<ShardRange>, FleetError> {
        if total_shards == 0 {
            return Err(FleetError::Config("total shard count must be at least 1".to_string()));
        }

        let first = self.config.first_shard.unwrap_or(0);
        let last = self.config.last_shard.unwrap_or(total_shards - 1);
        if first > last || last >= total_shards {
            return Err(FleetError::Config(format!(
                "shard range {first}-{last} does not fit {total_shards} total shards"
            )));
        }

        let ranges = partition_range(first, last, self.config.cluster_count);
        self.total_shards = total_shards;
        self.cluster_count = ranges.len() as u32;
        self.running = true;

        if self.cluster_count < self.config.cluster_count {
            warn!(
                requested = self.config.cluster_count,
                clusters = self.cluster_count,
                "More clusters requested than shards available, clamping"
            );
        }

        info!(
            name = %self.config.name,
            total_shards,
            first_shard = first,
            last_shard = last,
            clusters = self.cluster_count,
            "Starting fleet"
        );
        self.notifier.notify(Notification::new(
            colors::YELLOW,
            "Starting fleet",
            format!(
                "Launching {} clusters for shards {first}-{last} of {total_shards}",
                self.cluster_count
            ),
        ));

        for (cluster_id, range) in (0..).zip(ranges.iter().copied()) {
            self.registry.insert(WorkerRecord::new(cluster_id, range));
            if let Err(e) = self.launch(cluster_id) {
                error!(cluster_id, error = %e, "Failed to launch worker");
                self.metrics.record_error(e.error_type_label());
                self.registry.detach(cluster_id);
            }
        }

        self.publish_status();
        Ok(ranges)
    }

    /// Spawn a process for `cluster_id`, bind it, and queue its connect
    fn launch(&mut self, cluster_id: ClusterId) -> Result<WorkerHandle, FleetError> {
        let range = self
            .registry
            .get(cluster_id)
            .map(|r| r.range)
            .ok_or_else(|| FleetError::Config(format!("unknown cluster {cluster_id}")))?;

        self.next_handle += 1;
        let handle = WorkerHandle(self.next_handle);
        let link = self
            .spawner
            .spawn(handle, cluster_id, self.events_tx.clone())?;
        self.registry.attach(cluster_id, handle, link.pid, link.tx);

        let directive = self.connect_directive(cluster_id, range);
        self.queue.remove_pending(&cluster_id);
        self.queue.enqueue(cluster_id, ManagerMessage::Connect(directive));

        info!(cluster_id, %handle, pid = link.pid, shards = %range, "Worker launched");
        self.notifier.notify(
            Notification::new(
                colors::YELLOW,
                format!("Cluster {cluster_id}"),
                "Worker launched, waiting for its turn to connect",
            )
            .with_code_field("Shards", range),
        );
        Ok(handle)
    }

    fn connect_directive(&self, cluster_id: ClusterId, range: ShardRange) -> ConnectDirective {
        ConnectDirective {
            cluster_id,
            first_shard_id: range.first,
            last_shard_id: range.last,
            max_shards: self.total_shards,
            token: self.config.discord_token.clone(),
            client_options: self.config.client_options.clone(),
            cluster_count: self.cluster_count,
            presence: self.config.presence.clone(),
            dry_run: self.config.dry_run,
        }
    }

    /// Wait for the queue to release its next connect directive and send it
    pub async fn dispatch_next(&mut self) {
        let item = self.queue.next_dispatch().await;
        self.dispatch(item);
    }

    fn dispatch(&mut self, item: QueueItem<ClusterId, ManagerMessage>) {
        let cluster_id = item.key;
        let delivered = self
            .registry
            .get(cluster_id)
            .map(|record| record.send(item.payload))
            .unwrap_or(false);

        if delivered {
            info!(cluster_id, "Connect directive sent");
        } else {
            warn!(cluster_id, "Worker unreachable, skipping its connect directive");
            self.queue.advance(&cluster_id);
        }
        self.publish_status();
    }

    pub fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Message { handle, message } => self.on_message(handle, message),
            ManagerEvent::Disconnected { handle } => self.on_disconnect(handle),
            ManagerEvent::Exited { handle, code } => self.on_exit(handle, code),
            ManagerEvent::Control(command) => self.on_control(command),
        }
        self.publish_status();
    }

    fn on_message(&mut self, handle: WorkerHandle, message: WorkerMessage) {
        let Some(cluster_id) = self.registry.cluster_for(handle) else {
            debug!(%handle, kind = message.kind(), "Ignoring message from replaced worker");
            return;
        };
        self.metrics.record_message(message.kind());

        match message {
            WorkerMessage::ShardsStarted => self.on_shards_started(cluster_id),
            WorkerMessage::StatsReport { round, stats } => self.on_stats_report(cluster_id, round, stats),
            WorkerMessage::FetchRequest(request) => {
                self.fetches.register(&request, cluster_id);
                let sent = self.registry.broadcast(&ManagerMessage::FetchRequest(request.clone()));
                debug!(
                    cluster_id,
                    request_id = %request.request_id,
                    kind = %request.kind,
                    id = request.id,
                    sent,
                    "Fetch request fanned out"
                );
                self.metrics.set_pending_fetches(self.fetches.len());
            }
            WorkerMessage::FetchResponse(response) => match self.fetches.resolve(&response) {
                Some(requester) => {
                    let request_id = response.request_id;
                    let delivered = self
                        .registry
                        .get(requester)
                        .map(|r| r.send(ManagerMessage::FetchResponse(response)))
                        .unwrap_or(false);
                    debug!(%request_id, from = cluster_id, requester, delivered, "Fetch answered");
                    self.metrics.set_pending_fetches(self.fetches.len());
                }
                None => {
                    debug!(request_id = %response.request_id, cluster_id, "Dropping answer to settled fetch");
                }
            },
            WorkerMessage::LifecycleLog { level, message } => self.relay_log(cluster_id, level, &message),
            WorkerMessage::Notify { notification } => self.notifier.notify(notification),
            WorkerMessage::Broadcast { payload } => {
                let sent = self.registry.broadcast(&ManagerMessage::Broadcast { payload });
                debug!(cluster_id, sent, "Broadcast relayed");
            }
            WorkerMessage::DirectSend {
                cluster_id: target,
                payload,
            } => {
                // Forwarded with the sender's id
                let delivered = self
                    .registry
                    .get(target)
                    .map(|r| r.send(ManagerMessage::DirectSend { cluster_id, payload }))
                    .unwrap_or(false);
                if !delivered {
                    warn!(cluster_id, target, "Direct send target unreachable");
                }
            }
        }
    }

    fn on_shards_started(&mut self, cluster_id: ClusterId) {
        if let Some(record) = self.registry.get_mut(cluster_id) {
            record.state = WorkerState::Ready;
        }
        self.queue.advance(&cluster_id);

        info!(cluster_id, "Cluster shards ready");
        self.notifier.notify(Notification::new(
            colors::GREEN,
            format!("Cluster {cluster_id}"),
            "All shards ready",
        ));

        if !self.announced
            && !self.registry.is_empty()
            && self.registry.count_in(WorkerState::Ready) == self.registry.len()
        {
            self.announced = true;
            info!(
                clusters = self.registry.len(),
                total_shards = self.total_shards,
                "All clusters ready"
            );
            self.notifier.notify(Notification::new(
                colors::GREEN,
                "Fleet started",
                format!(
                    "{} clusters running {} shards",
                    self.registry.len(),
                    self.total_shards
                ),
            ));
        }
    }

    fn on_stats_report(&mut self, cluster_id: ClusterId, round: Option<RoundId>, stats: WorkerStats) {
        if let Some(record) = self.registry.get_mut(cluster_id) {
            record.last_stats = Some(stats.clone());
        }

        let Some(round) = round else {
            return;
        };
        if let Some(aggregate) = self.stats.record(round, cluster_id, stats) {
            self.publish_stats(round, aggregate);
        }
    }

    fn publish_stats(&mut self, round: RoundId, aggregate: ClusterStats) {
        info!(
            round,
            guilds = aggregate.guilds,
            users = aggregate.users,
            voice = aggregate.voice,
            large_guilds = aggregate.large_guilds,
            exclusive_guilds = aggregate.exclusive_guilds,
            memory_bytes = aggregate.total_memory_bytes,
            clusters = aggregate.clusters.len(),
            "Fleet stats"
        );
        self.metrics.set_fleet_stats(&aggregate);

        if let Some(nats) = &self.nats {
            let nats = Arc::clone(nats);
            let snapshot = aggregate.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = nats.publish_stats(&snapshot).await {
                    metrics.record_error(e.error_type_label());
                }
            });
        }

        self.stats_tx.send_replace(Some(aggregate));
    }

    /// Open a stats round and ask every reachable worker for a report.
    /// `None` when no worker is online.
    pub fn begin_stats_round(&mut self) -> Option<RoundId> {
        let targets: Vec<ClusterId> = self
            .registry
            .iter()
            .filter(|r| r.state.is_online())
            .map(|r| r.cluster_id)
            .collect();

        if self.stats.is_open() {
            debug!("Previous stats round incomplete, discarding it");
        }
        let round = self.stats.begin_round(targets.len());
        if targets.is_empty() {
            debug!(round, "No worker online, skipping stats round");
            return None;
        }

        for cluster_id in &targets {
            if let Some(record) = self.registry.get(*cluster_id) {
                record.send(ManagerMessage::StatsRequest { round });
            }
        }
        debug!(round, workers = targets.len(), "Stats round opened");
        Some(round)
    }

    fn relay_log(&self, cluster_id: ClusterId, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => error!(cluster_id, "{message}"),
            LogLevel::Warn => warn!(cluster_id, "{message}"),
            LogLevel::Log | LogLevel::Info => info!(cluster_id, "{message}"),
            LogLevel::Debug if self.config.debug => info!(cluster_id, worker_debug = true, "{message}"),
            LogLevel::Debug => {}
        }
    }

    fn on_disconnect(&mut self, handle: WorkerHandle) {
        let Some(cluster_id) = self.registry.cluster_for(handle) else {
            return;
        };
        if let Some(record) = self.registry.get_mut(cluster_id) {
            record.state = WorkerState::Disconnected;
        }
        warn!(cluster_id, %handle, "Worker IPC channel closed");
        self.notifier.notify(Notification::new(
            colors::YELLOW,
            format!("Cluster {cluster_id}"),
            "Worker disconnected",
        ));
    }

    fn on_exit(&mut self, handle: WorkerHandle, code: Option<i32>) {
        let Some(cluster_id) = self.registry.cluster_for(handle) else {
            debug!(%handle, ?code, "Ignoring exit of replaced worker");
            return;
        };
        self.registry.detach(cluster_id);

        let code_label = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        if code == Some(RESTART_EXIT_CODE) {
            info!(cluster_id, %handle, "Worker exited on request");
        } else {
            error!(cluster_id, %handle, code = %code_label, "Worker exited");
            self.metrics.record_error("worker_exit");
        }
        self.notifier.notify(
            Notification::new(colors::RED, format!("Cluster {cluster_id}"), "Worker exited")
                .with_code_field("Exit code", &code_label),
        );

        if self.running {
            self.respawn(cluster_id);
        }
    }

    fn respawn(&mut self, cluster_id: ClusterId) {
        if self.queue.in_flight() == Some(&cluster_id) {
            self.queue.advance(&cluster_id);
        }

        match self.launch(cluster_id) {
            Ok(handle) => {
                let restarts = self.registry.get_mut(cluster_id).map(|record| {
                    record.restarts += 1;
                    record.restarts
                });
                self.metrics.record_restart(cluster_id);
                info!(cluster_id, %handle, restarts, "Worker replaced");
            }
            Err(e) => {
                error!(cluster_id, error = %e, "Failed to replace worker, retrying later");
                self.metrics.record_error(e.error_type_label());
                self.registry.detach(cluster_id);
            }
        }
    }

    fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Restart { cluster_id, reply } => {
                let delivered = self
                    .registry
                    .get(cluster_id)
                    .filter(|r| r.state.is_online())
                    .map(|r| r.send(ManagerMessage::RestartRequest))
                    .unwrap_or(false);
                if delivered {
                    info!(cluster_id, "Restart requested by operator");
                } else {
                    warn!(cluster_id, "Restart requested for unreachable cluster");
                }
                let _ = reply.send(delivered);
            }
        }
    }

    /// Expire unanswered fetches and retry workers whose replacement
    /// failed to spawn
    pub fn maintain(&mut self) {
        for (request_id, pending) in self.fetches.expire(Instant::now()) {
            debug!(
                %request_id,
                kind = %pending.kind,
                id = pending.id,
                requester = pending.requester,
                "Fetch expired unanswered"
            );
            if let Some(record) = self.registry.get(pending.requester) {
                record.send(ManagerMessage::FetchResponse(FetchResponse {
                    request_id,
                    id: pending.id,
                    value: None,
                }));
            }
        }

        if self.running {
            let exited: Vec<ClusterId> = self
                .registry
                .iter()
                .filter(|r| r.state == WorkerState::Exited)
                .map(|r| r.cluster_id)
                .collect();
            for cluster_id in exited {
                self.respawn(cluster_id);
            }
        }

        self.publish_status();
    }

    fn publish_status(&self) {
        for state in [
            WorkerState::Spawning,
            WorkerState::Online,
            WorkerState::Ready,
            WorkerState::Disconnected,
            WorkerState::Exited,
        ] {
            self.metrics.set_workers(state, self.registry.count_in(state));
        }
        self.metrics.set_queue_depth(self.queue.len());
        self.metrics.set_pending_fetches(self.fetches.len());

        self.status_tx.send_replace(FleetStatus {
            started: self.announced,
            total_shards: self.total_shards,
            cluster_count: self.cluster_count,
            queue_depth: self.queue.len(),
            pending_fetches: self.fetches.len(),
            clusters: self.registry.summaries(),
        });
    }

    /// Run the event loop until `shutdown` resolves, then stop every worker
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        let period = self.config.stats_interval.max(Duration::from_millis(1));
        let stats_enabled = self.config.stats_enabled;
        let mut stats_timer = tokio::time::interval_at(Instant::now() + period, period);
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                item = self.queue.next_dispatch() => self.dispatch(item),
                _ = stats_timer.tick(), if stats_enabled => {
                    self.begin_stats_round();
                }
                _ = maintenance.tick() => self.maintain(),
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping workers");
                    break;
                }
            }
        }

        self.running = false;
        self.spawner.shutdown();
        if let Some(nats) = &self.nats {
            nats.close().await;
        }
        info!("Cluster manager stopped");
    }
}
