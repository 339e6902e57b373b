//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const SUBMISSIONS_TOTAL: &str = "courier_submissions_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "courier_delivery_failures_total";
    pub const SIGNALS_TOTAL: &str = "courier_signals_total";
    pub const TOPICS_ACTIVE: &str = "courier_topics_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "courier_subscriptions_total";
    pub const SUBMIT_LATENCY_SECONDS: &str = "courier_submit_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::SUBMISSIONS_TOTAL,
        "Total number of committed message submissions"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of live pushes delivered"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Total number of per-handle push failures"
    );
    metrics::describe_counter!(names::SIGNALS_TOTAL, "Total number of ephemeral signals");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of subscribed topics");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of topic subscriptions"
    );
    metrics::describe_histogram!(
        names::SUBMIT_LATENCY_SECONDS,
        "Submission processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a committed submission and its delivery counts.
pub fn record_submission(kind: &str, delivered: usize, failed: usize) {
    counter!(names::SUBMISSIONS_TOTAL, "kind" => kind.to_string()).increment(1);
    counter!(names::DELIVERIES_TOTAL).increment(delivered as u64);
    if failed > 0 {
        counter!(names::DELIVERY_FAILURES_TOTAL).increment(failed as u64);
    }
}

/// Record an ephemeral signal and how many handles it reached.
pub fn record_signal(reached: usize) {
    counter!(names::SIGNALS_TOTAL).increment(1);
    counter!(names::DELIVERIES_TOTAL).increment(reached as u64);
}

/// Record submission latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::SUBMIT_LATENCY_SECONDS).record(seconds);
}

/// Record a topic subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
