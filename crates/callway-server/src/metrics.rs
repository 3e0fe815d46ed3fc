//! Metrics collection and export for Callway.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tenvis_callway_core::{HubHandle, HubStats};
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "callway_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "callway_connections_active";
    pub const CONNECTIONS_REFUSED: &str = "callway_connections_refused_total";
    pub const FRAMES_TOTAL: &str = "callway_frames_total";
    pub const FRAMES_BYTES: &str = "callway_frames_bytes";
    pub const ONLINE_USERS: &str = "callway_online_users";
    pub const ACTIVE_CALLS: &str = "callway_active_calls";
    pub const CALLS_STARTED: &str = "callway_calls_started_total";
    pub const CALLS_ENDED: &str = "callway_calls_ended_total";
    pub const CALLS_REFUSED: &str = "callway_calls_refused_total";
    pub const ROUTING_MISSES: &str = "callway_routing_misses_total";
    pub const LATENCY_SECONDS: &str = "callway_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "callway_errors_total";
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
        names::CONNECTIONS_REFUSED,
        "Upgrades refused by authentication or limits"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::ONLINE_USERS, "Users with a live connection");
    metrics::describe_gauge!(names::ACTIVE_CALLS, "Calls that have not ended");
    metrics::describe_counter!(names::CALLS_STARTED, "Calls that started ringing");
    metrics::describe_counter!(names::CALLS_ENDED, "Calls ended, by reason");
    metrics::describe_counter!(
        names::CALLS_REFUSED,
        "Call attempts refused because the callee was offline or busy"
    );
    metrics::describe_counter!(
        names::ROUTING_MISSES,
        "Frames addressed to users without a live connection"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
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

/// Record a refused upgrade.
pub fn record_refused(reason: &'static str) {
    counter!(names::CONNECTIONS_REFUSED, "reason" => reason).increment(1);
}

/// Record a frame.
pub fn record_frame(direction: &'static str, event: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "event" => event).increment(1);
}

/// Record bytes moved over a WebSocket.
pub fn record_bytes(direction: &'static str, bytes: usize) {
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish hub counters.
///
/// The hub keeps lifetime totals, so counters are set absolutely.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::ONLINE_USERS).set(stats.online_users as f64);
    gauge!(names::ACTIVE_CALLS).set(stats.active_calls as f64);

    let calls = &stats.calls;
    counter!(names::CALLS_STARTED).absolute(calls.started);
    counter!(names::CALLS_REFUSED, "reason" => "unavailable").absolute(calls.unavailable);
    counter!(names::CALLS_REFUSED, "reason" => "busy").absolute(calls.busy);
    counter!(names::CALLS_ENDED, "reason" => "rejected").absolute(calls.rejected);
    counter!(names::CALLS_ENDED, "reason" => "hangup").absolute(calls.hangup);
    counter!(names::CALLS_ENDED, "reason" => "disconnected").absolute(calls.disconnected);
    counter!(names::CALLS_ENDED, "reason" => "timeout").absolute(calls.timed_out);
    counter!(names::ROUTING_MISSES).absolute(stats.routing.dropped);
}

/// Poll the hub and publish its counters until it stops.
pub async fn report_hub_stats(hub: HubHandle, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match hub.stats().await {
            Ok(stats) => record_hub_stats(&stats),
            Err(e) => {
                debug!(error = %e, "Stats reporter stopping");
                break;
            }
        }
    }
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
    use tenvis_callway_core::{Hub, HubConfig};

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_record_hub_stats_without_recorder() {
        record_hub_stats(&HubStats::default());
    }

    #[tokio::test]
    async fn test_reporter_stops_with_hub() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let reporter = tokio::spawn(report_hub_stats(hub.clone(), Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reporter.is_finished());

        task.abort();
        let _ = task.await;
        drop(hub);
        assert!(reporter.await.is_ok());
    }
}
