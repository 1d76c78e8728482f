//! Prometheus metrics for the admission dispatcher
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `admission_decisions_total` (counter): final decisions labeled by decision (admit/deny/error).
//! - `admission_webhook_invocations_total` (counter): webhook calls labeled by webhook and outcome.
//! - `admission_webhook_duration_seconds` (histogram): webhook call latency labeled by webhook.
//! - `admission_config_snapshot_configurations` (gauge): configurations in the current snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for decision metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    /// "admit", "deny" or "error"
    pub decision: String,
}

/// Labels for webhook invocation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InvocationLabels {
    pub webhook: String,
    /// "allowed", "denied", "ignored" or "fatal"
    pub outcome: String,
}

/// Labels for webhook latency metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub webhook: String,
}

/// Counter tracking admission decisions
pub static DECISIONS_TOTAL: Lazy<Family<DecisionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking webhook invocations by resolved outcome
pub static WEBHOOK_INVOCATIONS_TOTAL: Lazy<Family<InvocationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking webhook call duration (seconds)
pub static WEBHOOK_DURATION_SECONDS: Lazy<Family<WebhookLabels, Histogram>> = Lazy::new(|| {
    fn webhook_histogram() -> Histogram {
        // 1ms .. ~32s, covering the longest permitted webhook timeout.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(webhook_histogram)
});

/// Gauge tracking the size of the published configuration snapshot
pub static SNAPSHOT_CONFIGURATIONS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // Counters get their `_total` suffix from the encoder.
    registry.register(
        "admission_decisions",
        "Total number of admission decisions",
        DECISIONS_TOTAL.clone(),
    );
    registry.register(
        "admission_webhook_invocations",
        "Total number of webhook invocations by outcome",
        WEBHOOK_INVOCATIONS_TOTAL.clone(),
    );
    registry.register(
        "admission_webhook_duration_seconds",
        "Duration of webhook invocations in seconds",
        WEBHOOK_DURATION_SECONDS.clone(),
    );
    registry.register(
        "admission_config_snapshot_configurations",
        "Number of webhook configurations in the current snapshot",
        SNAPSHOT_CONFIGURATIONS.clone(),
    );

    registry
});

/// Increment the decision counter.
pub fn inc_decision(decision: &str) {
    let labels = DecisionLabels {
        decision: decision.to_string(),
    };
    DECISIONS_TOTAL.get_or_create(&labels).inc();
}

/// Record one webhook invocation and its latency.
pub fn observe_webhook_invocation(webhook: &str, outcome: &str, seconds: f64) {
    let labels = InvocationLabels {
        webhook: webhook.to_string(),
        outcome: outcome.to_string(),
    };
    WEBHOOK_INVOCATIONS_TOTAL.get_or_create(&labels).inc();

    let labels = WebhookLabels {
        webhook: webhook.to_string(),
    };
    WEBHOOK_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Set the snapshot size gauge.
pub fn set_snapshot_configurations(count: usize) {
    SNAPSHOT_CONFIGURATIONS.set(count as i64);
}

/// Render the registry in the OpenMetrics text format.
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
