//! Prometheus metrics for the Beacon server.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "beacon_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "beacon_subscriptions_total";
    pub const REJECTED_TOTAL: &str = "beacon_rejected_total";
    pub const PRESENCE_EVICTED_TOTAL: &str = "beacon_presence_evicted_total";
}

/// Describe every metric the server emits.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of envelopes processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of envelopes processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of live channels");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of client channel subscriptions"
    );
    metrics::describe_counter!(
        names::REJECTED_TOTAL,
        "Client actions rejected by the broker, by error kind"
    );
    metrics::describe_counter!(
        names::PRESENCE_EVICTED_TOTAL,
        "Presence entries evicted by the stale sweep"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus scrape endpoint.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an envelope.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a client subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the live channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record a rejected client action.
pub fn record_rejection(kind: &'static str) {
    counter!(names::REJECTED_TOTAL, "kind" => kind).increment(1);
}

/// Record presence entries removed by the sweep.
pub fn record_presence_evicted(count: usize) {
    counter!(names::PRESENCE_EVICTED_TOTAL).increment(count as u64);
}

/// Records a disconnection when the connection task ends.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Record a connection and return its guard.
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
    fn test_recording_without_recorder() {
        let _guard = ConnectionMetricsGuard::new();
        record_message(128, "inbound");
        record_rejection("permission");
        set_active_channels(3);
    }
}
