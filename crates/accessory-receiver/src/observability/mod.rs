//! Observability for the accessory receiver.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with an explicit allow-list of
//! safe fields (session id, peer address, transport type). Key material,
//! PINs and passwords never reach a span or event; a truncated SHA-256
//! fingerprint stands in for a key when one must be correlated.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `ar_sessions_active` | Gauge | none | Live sessions |
//! | `ar_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |
//! | `ar_session_failures_total` | Counter | `reason` | Connections that never became sessions |
//! | `ar_session_teardowns_total` | Counter | `reason` | Completed teardowns by reason |
//! | `ar_command_timeouts_total` | Counter | `command` | Controller commands past deadline |
//! | `ar_late_replies_discarded_total` | Counter | none | Replies after retirement |
//! | `ar_resource_decisions_total` | Counter | `resource`, `outcome` | Arbitration outcomes |
//! | `ar_session_start_seconds` | Histogram | none | Connect-to-active time |

pub mod metrics;

pub use metrics::init_metrics_recorder;
