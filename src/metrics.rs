//! Prometheus metrics for monitoring vigil itself.
//!
//! Covers poll outcomes and latency per node, node health rollups, and the
//! stale cache's load/refresh counters.

use crate::cache::MonitorStatus;
use prometheus::{CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// All metrics for the vigil service
pub struct Metrics {
    pub registry: Registry,

    // Poll metrics
    pub polls_total: CounterVec,
    pub poll_duration_seconds: HistogramVec,
    pub polls_in_flight: Gauge,

    // Node metrics
    pub node_status: GaugeVec,
    pub registry_nodes: Gauge,

    // Stale cache metrics
    pub stale_cache_events_total: CounterVec,

    // System metrics
    pub uptime_seconds: Gauge,
    started_at: Instant,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let polls_total = CounterVec::new(
            Opts::new("vigil_polls_total", "Completed polls by outcome"),
            &["node", "cache", "status"],
        )?;
        registry.register(Box::new(polls_total.clone()))?;

        let poll_duration_seconds = HistogramVec::new(
            HistogramOpts::new("vigil_poll_duration_seconds", "Poll duration in seconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["node"],
        )?;
        registry.register(Box::new(poll_duration_seconds.clone()))?;

        let polls_in_flight = Gauge::with_opts(Opts::new(
            "vigil_polls_in_flight",
            "Fetches currently executing",
        ))?;
        registry.register(Box::new(polls_in_flight.clone()))?;

        let node_status = GaugeVec::new(
            Opts::new(
                "vigil_node_status",
                "Aggregate node status (0 unknown, 1 good, 2 warning, 3 critical)",
            ),
            &["node"],
        )?;
        registry.register(Box::new(node_status.clone()))?;

        let registry_nodes = Gauge::with_opts(Opts::new(
            "vigil_registry_nodes",
            "Nodes registered for polling",
        ))?;
        registry.register(Box::new(registry_nodes.clone()))?;

        let stale_cache_events_total = CounterVec::new(
            Opts::new(
                "vigil_stale_cache_events_total",
                "Stale cache loads, refreshes and healed refresh markers",
            ),
            &["cache", "event"],
        )?;
        registry.register(Box::new(stale_cache_events_total.clone()))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "vigil_uptime_seconds",
            "Time since process start",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            polls_total,
            poll_duration_seconds,
            polls_in_flight,
            node_status,
            registry_nodes,
            stale_cache_events_total,
            uptime_seconds,
            started_at: Instant::now(),
        })
    }

    /// Record a completed poll
    pub fn record_poll(&self, node: &str, cache: &str, status: &str, duration_secs: f64) {
        self.polls_total
            .with_label_values(&[node, cache, status])
            .inc();
        self.poll_duration_seconds
            .with_label_values(&[node])
            .observe(duration_secs);
    }

    pub fn poll_started(&self) {
        self.polls_in_flight.inc();
    }

    pub fn poll_finished(&self) {
        self.polls_in_flight.dec();
    }

    /// Record a stale cache event (sync_load, refresh_ok, refresh_failed, lock_healed)
    pub fn record_stale_cache_event(&self, cache: &str, event: &str) {
        self.stale_cache_events_total
            .with_label_values(&[cache, event])
            .inc();
    }

    /// Update node rollup gauges
    pub fn update_node_status(&self, node: &str, status: MonitorStatus) {
        self.node_status
            .with_label_values(&[node])
            .set(status.as_gauge());
    }

    /// Drop the status series of a deregistered node
    pub fn forget_node(&self, node: &str) {
        let _ = self.node_status.remove_label_values(&[node]);
    }

    pub fn set_registry_size(&self, nodes: usize) {
        self.registry_nodes.set(nodes as f64);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> anyhow::Result<SharedMetrics> {
    Ok(Arc::new(Metrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.render().contains("vigil_uptime_seconds"));
    }

    #[test]
    fn test_poll_recording() {
        let metrics = Metrics::new().unwrap();
        metrics.record_poll("redis-1", "info", "success", 0.02);
        metrics.update_node_status("redis-1", MonitorStatus::Warning);

        let output = metrics.render();
        assert!(output.contains("vigil_polls_total"));
        assert!(output.contains("vigil_poll_duration_seconds"));
        assert!(output.contains("vigil_node_status{node=\"redis-1\"} 2"));
    }

    #[test]
    fn test_stale_cache_events() {
        let metrics = Metrics::new().unwrap();
        metrics.record_stale_cache_event("dns", "sync_load");
        metrics.record_stale_cache_event("dns", "sync_load");

        let output = metrics.render();
        assert!(output.contains("vigil_stale_cache_events_total{cache=\"dns\",event=\"sync_load\"} 2"));
    }
}
