//! Prometheus metrics for the routing core
//!
//! Counters are updated in-process as messages are routed and sessions
//! come and go; gauges are sampled from the registries when metrics are
//! gathered. Serving them over HTTP is left to the embedding binary;
//! `gather_text` renders the text exposition format.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// All routing core metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Publish metrics
    pub publish_received_total: IntCounter,
    pub publish_delivered_total: IntCounter,
    pub publish_queued_total: IntCounter,
    pub publish_dropped_total: IntCounter,

    // Session metrics
    pub sessions_current: IntGauge,
    pub sessions_expired_total: IntCounter,
    pub sessions_taken_over_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,

    // Retained messages
    pub retained_messages_current: IntGauge,

    // QoS metrics
    pub inflight_messages: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("valid metric options");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).expect("valid metric options");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        Metrics {
            publish_received_total: counter(
                &registry,
                "vibemq_publish_received_total",
                "Total PUBLISH messages accepted for routing",
            ),
            publish_delivered_total: counter(
                &registry,
                "vibemq_publish_delivered_total",
                "Total PUBLISH messages handed to a live connection",
            ),
            publish_queued_total: counter(
                &registry,
                "vibemq_publish_queued_total",
                "Total PUBLISH messages placed in a session queue",
            ),
            publish_dropped_total: counter(
                &registry,
                "vibemq_publish_dropped_total",
                "Total PUBLISH messages dropped due to queue overflow or policy",
            ),
            sessions_current: gauge(
                &registry,
                "vibemq_sessions_current",
                "Current number of sessions, attached or not",
            ),
            sessions_expired_total: counter(
                &registry,
                "vibemq_sessions_expired_total",
                "Total sessions expired since startup",
            ),
            sessions_taken_over_total: counter(
                &registry,
                "vibemq_sessions_taken_over_total",
                "Total connections evicted by a newer connection for the same client",
            ),
            subscriptions_current: gauge(
                &registry,
                "vibemq_subscriptions_current",
                "Current number of subscriptions",
            ),
            retained_messages_current: gauge(
                &registry,
                "vibemq_retained_messages_current",
                "Current number of retained messages",
            ),
            inflight_messages: gauge(
                &registry,
                "vibemq_inflight_messages",
                "Outbound QoS 1/2 messages awaiting acknowledgement",
            ),
            registry,
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
