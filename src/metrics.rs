// Prometheus metrics definitions for the relay.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Users currently held in the activity ledger.
    pub static ref TRACKED_USERS: IntGauge =
        IntGauge::new("relay_tracked_users", "Users in the activity ledger").unwrap();

    /// Duel sessions with a live channel.
    pub static ref DUEL_SESSIONS: IntGauge =
        IntGauge::new("relay_duel_sessions", "Live duel sessions").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Reward requests sent to the backend, by action and outcome.
    pub static ref REWARD_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_reward_requests_total", "Reward requests sent to the backend"),
        &["action", "outcome"],
    )
    .unwrap();

    /// Completed presence scans.
    pub static ref PRESENCE_SCANS_TOTAL: IntCounter = IntCounter::new(
        "relay_presence_scans_total",
        "Completed presence reconciliation scans",
    )
    .unwrap();

    /// Duel channels created.
    pub static ref DUEL_CHANNELS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "relay_duel_channels_created_total",
        "Duel channels created",
    )
    .unwrap();

    /// Duel channels deleted, by reason (expired, orphan).
    pub static ref DUEL_CHANNELS_DELETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_duel_channels_deleted_total", "Duel channels deleted"),
        &["reason"],
    )
    .unwrap();

    /// Nickname renames, by result.
    pub static ref NICKNAME_RENAMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_nickname_renames_total", "Nickname rename attempts"),
        &["result"],
    )
    .unwrap();

    /// Inbound events accepted by the ingress, by kind.
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("relay_events_received_total", "Inbound chat events"),
        &["kind"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TRACKED_USERS.clone()),
        Box::new(DUEL_SESSIONS.clone()),
        Box::new(REWARD_REQUESTS_TOTAL.clone()),
        Box::new(PRESENCE_SCANS_TOTAL.clone()),
        Box::new(DUEL_CHANNELS_CREATED_TOTAL.clone()),
        Box::new(DUEL_CHANNELS_DELETED_TOTAL.clone()),
        Box::new(NICKNAME_RENAMES_TOTAL.clone()),
        Box::new(EVENTS_RECEIVED_TOTAL.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("Metric already registered: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        // Registering twice is harmless
        register_metrics();
        DUEL_CHANNELS_CREATED_TOTAL.inc();
        let output = gather_metrics();
        assert!(output.contains("relay_duel_channels_created_total"));
    }

    #[test]
    fn test_metric_increments() {
        DUEL_SESSIONS.inc();
        DUEL_SESSIONS.dec();

        REWARD_REQUESTS_TOTAL
            .with_label_values(&["presence_activity", "granted"])
            .inc();
        DUEL_CHANNELS_DELETED_TOTAL
            .with_label_values(&["orphan"])
            .inc();
        NICKNAME_RENAMES_TOTAL
            .with_label_values(&["renamed"])
            .inc();
        EVENTS_RECEIVED_TOTAL.with_label_values(&["message"]).inc();
        PRESENCE_SCANS_TOTAL.inc();
        assert!(PRESENCE_SCANS_TOTAL.get() >= 1);
    }
}
