//! Health and control endpoints
//!
//! Served by the manager only. Reads the fleet snapshot the manager
//! publishes after every event; the restart route goes back through the
//! manager's event loop.

use crate::ipc::ClusterId;
use crate::manager::{ClusterStats, FleetStatus, ManagerControl};
use crate::metrics::FleetMetrics;
use crate::nats::NatsPublisher;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub clusters: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsCounters>,
}

#[derive(Debug, Serialize)]
pub struct NatsCounters {
    pub connected: bool,
    pub published: u64,
    pub failures: u64,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub started: bool,
    pub total_shards: u32,
    pub clusters_total: usize,
    pub clusters_ready: usize,
    pub queue_depth: usize,
    pub nats_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub cluster_id: ClusterId,
    pub requested: bool,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<FleetStatus>,
    pub stats: watch::Receiver<Option<ClusterStats>>,
    pub control: ManagerControl,
    pub nats: Option<Arc<NatsPublisher>>,
    pub metrics: FleetMetrics,
}

/// Create the health and control router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/clusters", get(clusters_handler))
        .route("/clusters/{id}/restart", post(restart_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        clusters: state.status.borrow().clusters.len(),
        nats: state.nats.as_ref().map(|n| NatsCounters {
            connected: n.is_connected(),
            published: n.messages_published(),
            failures: n.publish_failures(),
        }),
    })
}

/// Readiness endpoint - returns 200 once every cluster has its shards ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());
    let status = state.status.borrow().clone();

    let is_ready = status.all_ready() && nats_connected;

    let response = ReadyResponse {
        ready: is_ready,
        started: status.started,
        total_shards: status.total_shards,
        clusters_total: status.clusters.len(),
        clusters_ready: status.ready_clusters(),
        queue_depth: status.queue_depth,
        nats_connected,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

/// Last completed stats aggregate
async fn stats_handler(State(state): State<AppState>) -> axum::response::Response {
    let stats = state.stats.borrow().clone();
    match stats {
        Some(stats) => (StatusCode::OK, Json(stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no stats round has completed yet".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn clusters_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().clusters.clone())
}

async fn restart_handler(
    State(state): State<AppState>,
    Path(cluster_id): Path<ClusterId>,
) -> axum::response::Response {
    match state.control.restart(cluster_id).await {
        Ok(true) => (
            StatusCode::ACCEPTED,
            Json(RestartResponse {
                cluster_id,
                requested: true,
            }),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("cluster {cluster_id} is not running"),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(cluster_id, error = %e, "Restart request could not reach the manager");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse { error: e.to_string() }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::error::FleetError;
    use crate::ipc::ManagerMessage;
    use crate::manager::{ClusterManager, ManagerEvent, WorkerHandle, WorkerLink, WorkerSpawner};
    use tokio::sync::mpsc;

    struct NullSpawner;

    impl WorkerSpawner for NullSpawner {
        fn spawn(
            &mut self,
            _handle: WorkerHandle,
            _cluster_id: ClusterId,
            _events: mpsc::UnboundedSender<ManagerEvent>,
        ) -> Result<WorkerLink, FleetError> {
            let (tx, _rx) = mpsc::unbounded_channel::<ManagerMessage>();
            Ok(WorkerLink { pid: None, tx })
        }
    }

    fn state(manager: &ClusterManager) -> AppState {
        AppState {
            status: manager.status(),
            stats: manager.stats(),
            control: manager.control(),
            nats: None,
            metrics: FleetMetrics::detached(),
        }
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            clusters: 2,
            nats: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(!json.contains("nats"), "counters omitted without NATS");
    }

    #[tokio::test]
    async fn not_ready_until_clusters_report() {
        let mut manager = ClusterManager::new(FleetConfig::new("token"), NullSpawner);
        manager.start(2).unwrap();

        let response = ready_handler(State(state(&manager))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stats_are_not_found_before_first_round() {
        let manager = ClusterManager::new(FleetConfig::new("token"), NullSpawner);
        let response = stats_handler(State(state(&manager))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restart_without_manager_loop_is_unavailable() {
        let manager = ClusterManager::new(FleetConfig::new("token"), NullSpawner);
        let app_state = state(&manager);
        drop(manager);

        let response = restart_handler(State(app_state), Path(0)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
