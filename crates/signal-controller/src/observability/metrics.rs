//! Metrics definitions for the signal controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label is bounded:
//! - `method`: the client catalog (10 values) plus `unknown`
//! - `status`: `ok` and the `ScError::status_label` set
//! - `reason`: sweep eviction reasons (`not_owner`, `owner_missing`,
//!   `lookup_failed`)
//! - `target`: `location`, `relay`, `coordinator`
//! - `kind`: framing and envelope error kinds

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle `/metrics` renders.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Request latency includes location and relay round trips.
        .set_buckets_for_metric(
            Matcher::Prefix("sc_request_duration".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set request duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `sc_requests_total{method,status}`
pub fn record_request(method: &'static str, status: &'static str, duration: Duration) {
    counter!("sc_requests_total", "method" => method, "status" => status).increment(1);
    histogram!("sc_request_duration_seconds", "method" => method).record(duration.as_secs_f64());
}

/// Metric: `sc_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_rooms_active").set(count as f64);
}

/// Metric: `sc_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_peers_active").set(count as f64);
}

/// Metric: `sc_connections_active`
pub fn set_connections_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_connections_active").set(count as f64);
}

/// Metric: `sc_reconcile_evictions_total{reason}`
pub fn record_eviction(reason: &'static str) {
    counter!("sc_reconcile_evictions_total", "reason" => reason).increment(1);
}

/// Metric: `sc_rpc_failures_total{target}`
///
/// Counts failed cluster RPCs, both primary and best-effort cleanup ones.
pub fn record_rpc_failure(target: &'static str) {
    counter!("sc_rpc_failures_total", "target" => target).increment(1);
}

/// Metric: `sc_framing_errors_total{kind}`
pub fn record_framing_error(kind: &'static str) {
    counter!("sc_framing_errors_total", "kind" => kind).increment(1);
}

/// Metric: `sc_events_relayed_total{method}`
///
/// Events received from sibling coordinators or relays and delivered to
/// local peers.
pub fn record_event_relayed(method: &'static str) {
    counter!("sc_events_relayed_total", "method" => method).increment(1);
}

/// Metric: `sc_notifications_dropped_total`
///
/// Notifications discarded because a peer's outbound mailbox was full.
pub fn record_notification_dropped() {
    counter!("sc_notifications_dropped_total").increment(1);
}
