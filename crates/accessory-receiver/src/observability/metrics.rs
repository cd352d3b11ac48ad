//! Metrics definitions.
//!
//! Naming follows Prometheus conventions: `ar_` prefix, `_total` for
//! counters, `_seconds` for duration histograms. Every label is drawn from a
//! closed set (actor type, error label, command id, arbitration outcome).

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder. Must run before any metric is recorded.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Session start spans discovery through auth and stream setup
        .set_buckets_for_metric(
            Matcher::Full("ar_session_start_seconds".to_string()),
            &[0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0],
        )
        .map_err(|e| format!("Failed to set session start buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `ar_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("ar_sessions_active").set(count as f64);
}

/// Metric: `ar_actor_mailbox_depth`, labels: `actor_type` (server, session)
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("ar_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Metric: `ar_session_failures_total`, labels: `reason`
pub fn record_session_failed(reason: &'static str) {
    counter!("ar_session_failures_total", "reason" => reason).increment(1);
}

/// Metric: `ar_session_teardowns_total`, labels: `reason` (`planned` or an error label)
pub fn record_session_teardown(reason: &'static str) {
    counter!("ar_session_teardowns_total", "reason" => reason).increment(1);
}

/// Metric: `ar_command_timeouts_total`, labels: `command`
///
/// `command` is one of the fixed controller command ids.
pub fn record_command_timeout(command: &str) {
    counter!("ar_command_timeouts_total", "command" => command.to_string()).increment(1);
}

/// Metric: `ar_late_replies_discarded_total`
pub fn record_late_reply_discarded() {
    counter!("ar_late_replies_discarded_total").increment(1);
}

/// Metric: `ar_resource_decisions_total`, labels: `resource`, `outcome`
pub fn record_resource_decision(resource: &'static str, outcome: &'static str) {
    counter!("ar_resource_decisions_total", "resource" => resource, "outcome" => outcome)
        .increment(1);
}

/// Metric: `ar_session_start_seconds`
pub fn record_session_start(duration: Duration) {
    histogram!("ar_session_start_seconds").record(duration.as_secs_f64());
}
