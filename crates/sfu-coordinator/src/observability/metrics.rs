//! Metrics definitions for the SFU coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `message_type`: the eight client message types plus `invalid`
//! - `code` / `error_type`: bounded by `SfuError` variants
//! - `event`: four engine event kinds
//! - `actor_type`: two values (connection, engine_events)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round-trips include an engine call (p99 target < 100ms)
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Population (Gauges)
// ============================================================================

/// Set the number of open WebSocket connections.
///
/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Set the number of live sessions.
///
/// Metric: `sfu_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_sessions_active").set(count as f64);
}

/// Set the number of joined clients.
///
/// Metric: `sfu_clients_active`
pub fn set_clients_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_clients_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Count an inbound signaling message.
///
/// Metric: `sfu_messages_total`
/// Labels: `message_type`
pub fn record_message(message_type: &str) {
    counter!("sfu_messages_total", "message_type" => message_type.to_string()).increment(1);
}

/// Record signaling message handling latency.
///
/// Metric: `sfu_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("sfu_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Count an error reply.
///
/// Metric: `sfu_errors_total`
/// Labels: `error_type`, `code`
pub fn record_error(error_type: &str, code: i32) {
    counter!("sfu_errors_total",
        "error_type" => error_type.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Count a peer notification dropped because the recipient's queue was
/// full or closed.
///
/// Metric: `sfu_notifications_dropped_total`
pub fn record_notification_dropped() {
    counter!("sfu_notifications_dropped_total").increment(1);
}

// ============================================================================
// Engine
// ============================================================================

/// Count a media engine lifecycle event.
///
/// Metric: `sfu_engine_events_total`
/// Labels: `event`
pub fn record_engine_event(event: &str) {
    counter!("sfu_engine_events_total", "event" => event.to_string()).increment(1);
}
