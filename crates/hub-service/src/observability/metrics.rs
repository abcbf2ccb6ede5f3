//! Metrics definitions for the coordination hub.
//!
//! All metrics follow Prometheus naming conventions:
//! - `hub_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `event`: bounded by the inbound event names (~20 values)
//! - `outcome`: `ok` plus one value per error class (7 values)
//! - `operation`: bounded by repository methods (~10 values)
//! - `actor_type`: 2 values (registry, room)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by
/// `GET /metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Event handling latency: in-memory work plus at most one DB round trip
        .set_buckets_for_metric(
            Matcher::Prefix("hub_event".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set event latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("hub_db".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection & Room Metrics (Gauges)
// ============================================================================

/// Set the number of open WebSocket connections.
///
/// Metric: `hub_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_connections_active").set(count as f64);
}

/// Set the number of live call rooms.
///
/// Metric: `hub_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_rooms_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `hub_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Event Metrics
// ============================================================================

/// Record one handled inbound event.
///
/// Metrics: `hub_events_total` (labels: `event`, `outcome`) and
/// `hub_event_latency_seconds` (labels: `event`).
pub fn record_event(event: &str, outcome: &str, duration: Duration) {
    counter!("hub_events_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("hub_event_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Record an outbound event dropped because a connection queue was full.
///
/// Metric: `hub_messages_dropped_total`
///
/// Non-zero values mean at least one client is not keeping up.
pub fn record_message_dropped() {
    counter!("hub_messages_dropped_total").increment(1);
}

// ============================================================================
// Persistence & Actor Health
// ============================================================================

/// Record a repository query duration.
///
/// Metric: `hub_db_query_duration_seconds`
/// Labels: `operation`, `status` (success, error)
pub fn record_db_query(operation: &str, status: &str, duration: Duration) {
    histogram!("hub_db_query_duration_seconds",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a room actor closing.
///
/// Metric: `hub_rooms_closed_total`
/// Labels: `reason` (empty, ended, idle, shutdown)
pub fn record_room_closed(reason: &str) {
    counter!("hub_rooms_closed_total", "reason" => reason.to_string()).increment(1);
}

/// Record an actor task that ended by panicking.
///
/// Metric: `hub_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("hub_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These exercise the recording functions against the global no-op
    // recorder; values are not asserted.

    #[test]
    fn test_gauges() {
        set_connections_active(0);
        set_connections_active(42);
        set_rooms_active(3);
        set_actor_mailbox_depth("registry", 10);
        set_actor_mailbox_depth("room", 0);
    }

    #[test]
    fn test_record_event() {
        record_event("sendMessage", "ok", Duration::from_millis(4));
        record_event("joinVideoCall", "forbidden", Duration::from_micros(300));
    }

    #[test]
    fn test_counters_and_histograms() {
        record_message_dropped();
        record_db_query("find_appointment", "success", Duration::from_millis(2));
        record_db_query("create_message", "error", Duration::from_millis(30));
        record_actor_panic("room");
    }
}
