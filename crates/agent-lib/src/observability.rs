//! Observability infrastructure for the host monitor
//!
//! Provides:
//! - Prometheus metrics (samples, sample latency, anomalies, handler failures, investigations)
//! - Structured JSON logging with tracing

use crate::baseline::Baseline;
use crate::models::{AnomalyEvent, Fingerprint, Severity};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Default histogram buckets for sample latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    sample_latency_seconds: HistogramVec,
    samples_total: IntCounterVec,
    sample_errors_total: IntCounterVec,
    anomalies_total: IntCounterVec,
    events_dropped_total: IntCounterVec,
    handler_failures_total: IntCounterVec,
    investigations_total: IntCounterVec,
    engine_failures_total: IntCounter,
    watchers_running: IntGauge,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            sample_latency_seconds: register_histogram_vec!(
                "hostwatch_sample_latency_seconds",
                "Time spent acquiring one snapshot from the metric source",
                &["metric"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sample_latency_seconds"),

            samples_total: register_int_counter_vec!(
                "hostwatch_samples_total",
                "Snapshots successfully acquired",
                &["metric"]
            )
            .expect("Failed to register samples_total"),

            sample_errors_total: register_int_counter_vec!(
                "hostwatch_sample_errors_total",
                "Snapshot acquisitions that failed or timed out",
                &["metric"]
            )
            .expect("Failed to register sample_errors_total"),

            anomalies_total: register_int_counter_vec!(
                "hostwatch_anomalies_total",
                "Anomaly events published to the event bus",
                &["metric", "severity"]
            )
            .expect("Failed to register anomalies_total"),

            events_dropped_total: register_int_counter_vec!(
                "hostwatch_events_dropped_total",
                "Events dropped because a subscriber queue was full",
                &["handler"]
            )
            .expect("Failed to register events_dropped_total"),

            handler_failures_total: register_int_counter_vec!(
                "hostwatch_handler_failures_total",
                "Handler invocations that failed, timed out or panicked",
                &["handler"]
            )
            .expect("Failed to register handler_failures_total"),

            investigations_total: register_int_counter_vec!(
                "hostwatch_investigations_total",
                "Investigation gate decisions by outcome",
                &["outcome"]
            )
            .expect("Failed to register investigations_total"),

            engine_failures_total: register_int_counter!(
                "hostwatch_engine_failures_total",
                "Analysis engine calls that failed or timed out"
            )
            .expect("Failed to register engine_failures_total"),

            watchers_running: register_int_gauge!(
                "hostwatch_watchers_running",
                "Number of watcher tasks currently running"
            )
            .expect("Failed to register watchers_running"),
        }
    }
}

/// Monitor metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn observe_sample(&self, metric: &str, duration_secs: f64) {
        let inner = self.inner();
        inner
            .sample_latency_seconds
            .with_label_values(&[metric])
            .observe(duration_secs);
        inner.samples_total.with_label_values(&[metric]).inc();
    }

    pub fn inc_sample_errors(&self, metric: &str) {
        self.inner()
            .sample_errors_total
            .with_label_values(&[metric])
            .inc();
    }

    pub fn inc_anomalies(&self, metric: &str, severity: Severity) {
        self.inner()
            .anomalies_total
            .with_label_values(&[metric, &severity.to_string()])
            .inc();
    }

    pub fn inc_events_dropped(&self, handler: &str) {
        self.inner()
            .events_dropped_total
            .with_label_values(&[handler])
            .inc();
    }

    pub fn inc_handler_failures(&self, handler: &str) {
        self.inner()
            .handler_failures_total
            .with_label_values(&[handler])
            .inc();
    }

    /// Count one investigation gate decision (`dispatched`, `cached`, `skipped_*`)
    pub fn inc_investigations(&self, outcome: &str) {
        self.inner()
            .investigations_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_engine_failures(&self) {
        self.inner().engine_failures_total.inc();
    }

    pub fn watcher_started(&self) {
        self.inner().watchers_running.inc();
    }

    pub fn watcher_stopped(&self) {
        self.inner().watchers_running.dec();
    }
}

/// Structured logger for monitor lifecycle events
///
/// Keeps field names consistent across the watchers, handlers and gate.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log monitor startup
    pub fn log_startup(&self, version: &str, watchers: &[String]) {
        info!(
            event = "monitor_started",
            node = %self.node_name,
            version = %version,
            watchers = ?watchers,
            "Host monitor started"
        );
    }

    /// Log monitor shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Host monitor shutting down"
        );
    }

    /// Log a baseline leaving the learning phase
    pub fn log_baseline_established(&self, baseline: &Baseline) {
        info!(
            event = "baseline_established",
            node = %self.node_name,
            metric = %baseline.metric,
            mean = baseline.mean,
            spread = baseline.spread,
            samples = baseline.sample_count,
            window_start = %baseline.window_start,
            window_end = %baseline.window_end,
            "Baseline established"
        );
    }

    /// Log a baseline finalized with fewer samples than required
    pub fn log_degraded_baseline(&self, baseline: &Baseline, needed: u64) {
        warn!(
            event = "baseline_degraded",
            node = %self.node_name,
            metric = %baseline.metric,
            mean = baseline.mean,
            spread = baseline.spread,
            samples = baseline.sample_count,
            needed = needed,
            "Running detection on a degraded baseline"
        );
    }

    /// Log an anomaly published to the bus
    pub fn log_anomaly(&self, event: &AnomalyEvent) {
        match event.severity {
            Severity::Critical | Severity::Error => {
                warn!(
                    event = "anomaly_detected",
                    node = %self.node_name,
                    metric = %event.metric,
                    category = %event.category,
                    severity = %event.severity,
                    observed = event.observed,
                    fingerprint = %event.fingerprint.short(),
                    details = %event.description,
                    "Anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    node = %self.node_name,
                    metric = %event.metric,
                    category = %event.category,
                    severity = %event.severity,
                    observed = event.observed,
                    fingerprint = %event.fingerprint.short(),
                    details = %event.description,
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log the outcome of one investigation
    pub fn log_investigation(&self, fingerprint: &Fingerprint, outcome: &str, seen: u64) {
        info!(
            event = "investigation",
            node = %self.node_name,
            fingerprint = %fingerprint.short(),
            outcome = %outcome,
            seen = seen,
            "Investigation outcome"
        );
    }

    /// Log a failed analysis engine call
    pub fn log_engine_failure(&self, fingerprint: &Fingerprint, error: &str) {
        error!(
            event = "engine_failure",
            node = %self.node_name,
            fingerprint = %fingerprint.short(),
            error = %error,
            "Analysis engine call failed"
        );
    }
}
