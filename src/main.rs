//! Shard Fleet binary
//!
//! Runs as the manager unless started by one as a worker. The bundled
//! application only reports its launch; embedders provide their own
//! [`Application`] through the library.

use anyhow::{Context, Result};
use serde_json::Value;
use shard_fleet::config::FleetConfig;
use shard_fleet::health::{self, AppState};
use shard_fleet::ipc::ClusterId;
use shard_fleet::manager::{resolve_shard_count, ClusterManager, ProcessSpawner};
use shard_fleet::metrics::FleetMetrics;
use shard_fleet::nats::NatsPublisher;
use shard_fleet::notify::{DisabledNotifier, Notifier, WebhookNotifier};
use shard_fleet::{logging, worker, Application, FleetError, LaunchContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use twilight_model::id::Id;

/// Logs launches and relayed payloads
struct LaunchReporter;

impl Application for LaunchReporter {
    async fn on_launch(&self, ctx: LaunchContext) -> Result<(), FleetError> {
        ctx.logger.info(format!(
            "Cluster {} of {} launched with shards {} ({} guilds cached)",
            ctx.cluster_id,
            ctx.cluster_count,
            ctx.shards,
            ctx.cache.counts().guilds
        ));
        Ok(())
    }

    fn on_message(&self, from: Option<ClusterId>, payload: Value) {
        tracing::debug!(?from, %payload, "Payload received");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    shard_fleet::install_crypto_provider();

    if shard_fleet::is_worker_process() {
        let code = worker::run(LaunchReporter).await?;
        std::process::exit(code);
    }

    // Load configuration first to get log level
    let config = FleetConfig::from_env()?;
    logging::init_manager(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %config.name,
        clusters = config.cluster_count,
        total_shards = config.total_shards,
        "Starting shard fleet"
    );

    let metrics = FleetMetrics::install()?;
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = if let Some(ref url) = config.nats_url {
        match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                info!(url, "Connected to NATS");
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - stats stay local");
                None
            }
        }
    } else {
        info!("No NATS_URL configured - stats stay local");
        None
    };

    let http = Arc::new(twilight_http::Client::new(config.discord_token.clone()));

    let notifier: Arc<dyn Notifier> = match &config.webhook {
        Some((id, token)) => {
            let webhook_id = Id::new_checked(*id).context("FLEET_WEBHOOK_ID must be non-zero")?;
            Arc::new(WebhookNotifier::new(Arc::clone(&http), webhook_id, token.as_str()))
        }
        None => {
            info!("No webhook configured - notifications disabled");
            Arc::new(DisabledNotifier)
        }
    };

    let total_shards = resolve_shard_count(config.total_shards, config.guilds_per_shard, http.as_ref()).await?;

    let spawner = ProcessSpawner::current_exe()?
        .env("LOG_LEVEL", config.log_level.clone())
        .env(
            "FLEET_WORKER_STATS_INTERVAL_MS",
            config.worker_stats_interval.as_millis().to_string(),
        );

    let mut manager = ClusterManager::new(config.clone(), spawner)
        .with_notifier(notifier)
        .with_nats(nats.clone())
        .with_metrics(metrics.clone());
    manager.start(total_shards)?;

    // Start health server
    let app_state = AppState {
        status: manager.status(),
        stats: manager.stats(),
        control: manager.control(),
        nats,
        metrics,
    };

    let router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, router);

    tokio::select! {
        _ = manager.run(shutdown_signal()) => {}
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
    }

    info!("Shard fleet shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
