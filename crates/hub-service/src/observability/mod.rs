//! Observability for the coordination hub.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit field
//! allow-listing; message content, tokens and payloads are never recorded.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `hub_connections_active` | Gauge | none |
//! | `hub_rooms_active` | Gauge | none |
//! | `hub_rooms_closed_total` | Counter | `reason` |
//! | `hub_events_total` | Counter | `event`, `outcome` |
//! | `hub_event_latency_seconds` | Histogram | `event` |
//! | `hub_messages_dropped_total` | Counter | none |
//! | `hub_db_query_duration_seconds` | Histogram | `operation`, `status` |
//! | `hub_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `hub_actor_panics_total` | Counter | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Phase};
pub use metrics::init_metrics_recorder;
