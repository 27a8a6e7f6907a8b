//! Prometheus metrics module
//!
//! Manager-side fleet metrics. Recording goes through the `metrics` facade,
//! so a detached instance (no recorder installed) is a silent no-op.

use crate::ipc::ClusterId;
use crate::manager::stats::ClusterStats;
use crate::manager::WorkerState;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Fleet metrics collector
#[derive(Clone, Default)]
pub struct FleetMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl FleetMetrics {
    /// Install the global Prometheus recorder and register descriptions
    pub fn install() -> Result<Self, crate::error::FleetError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| crate::error::FleetError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics that record into whatever recorder is installed, if any
    pub fn detached() -> Self {
        Self { handle: None }
    }

    fn register_metrics() {
        describe_gauge!(
            "fleet_workers",
            Unit::Count,
            "Worker processes by state"
        );
        describe_counter!(
            "fleet_worker_restarts_total",
            Unit::Count,
            "Worker processes replaced after an exit"
        );
        describe_counter!(
            "fleet_worker_messages_total",
            Unit::Count,
            "Envelopes received from workers"
        );
        describe_counter!(
            "fleet_errors_total",
            Unit::Count,
            "Total fleet errors"
        );
        describe_gauge!(
            "fleet_queue_depth",
            Unit::Count,
            "Connect directives waiting in the startup queue"
        );
        describe_gauge!(
            "fleet_pending_fetches",
            Unit::Count,
            "Cross-worker fetches awaiting an answer"
        );
        describe_gauge!(
            "fleet_guilds_total",
            Unit::Count,
            "Guilds across the fleet at the last stats round"
        );
        describe_gauge!(
            "fleet_users_total",
            Unit::Count,
            "Users across the fleet at the last stats round"
        );
        describe_gauge!(
            "fleet_memory_bytes",
            Unit::Bytes,
            "Worker resident memory at the last stats round"
        );
    }

    /// Set the number of workers in `state`
    pub fn set_workers(&self, state: WorkerState, count: usize) {
        gauge!("fleet_workers", "state" => state.label()).set(count as f64);
    }

    pub fn record_restart(&self, cluster_id: ClusterId) {
        counter!(
            "fleet_worker_restarts_total",
            "cluster_id" => cluster_id.to_string()
        )
        .increment(1);
    }

    pub fn record_message(&self, kind: &'static str) {
        counter!("fleet_worker_messages_total", "kind" => kind).increment(1);
    }

    pub fn record_error(&self, error_type: &'static str) {
        counter!("fleet_errors_total", "error_type" => error_type).increment(1);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        gauge!("fleet_queue_depth").set(depth as f64);
    }

    pub fn set_pending_fetches(&self, count: usize) {
        gauge!("fleet_pending_fetches").set(count as f64);
    }

    /// Export the last aggregate
    pub fn set_fleet_stats(&self, stats: &ClusterStats) {
        gauge!("fleet_guilds_total").set(stats.guilds as f64);
        gauge!("fleet_users_total").set(stats.users as f64);
        for cluster in &stats.clusters {
            gauge!(
                "fleet_memory_bytes",
                "cluster_id" => cluster.cluster_id.to_string()
            )
            .set(cluster.stats.memory_bytes as f64);
        }
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_metrics_render_nothing() {
        let metrics = FleetMetrics::detached();
        metrics.set_queue_depth(3);
        metrics.record_restart(1);
        assert!(metrics.render().is_empty());
    }
}
