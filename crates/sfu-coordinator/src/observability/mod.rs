//! Observability module for the SFU coordinator.
//!
//! Metric labels are bounded to prevent cardinality explosion:
//! - `actor_type`: connection, engine_events
//! - `message_type`: the fixed set of client message types
//! - `error_type`: the fixed set of error labels
//! - `event`: the fixed set of engine event kinds
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_connections_active` | Gauge | none | Open signaling connections |
//! | `sfu_clients_active` | Gauge | none | Joined clients |
//! | `sfu_sessions_active` | Gauge | none | Non-empty sessions |
//! | `sfu_messages_total` | Counter | `message_type` | Client messages handled |
//! | `sfu_message_latency_seconds` | Histogram | `message_type` | Handling latency |
//! | `sfu_errors_total` | Counter | `error_type`, `code` | Error replies sent |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `sfu_notifications_dropped_total` | Counter | none | Fan-out to closed connections |
//! | `sfu_engine_events_total` | Counter | `event` | Engine lifecycle events |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Readiness};
pub use metrics::init_metrics_recorder;
