//! Prometheus metrics for the message core
//!
//! Broker-wide series only; per-session counters live on the session.

use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

/// All message-core metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// Messages handed to sessions for delivery
    pub messages_sent: IntCounter,
    /// Messages dropped because a session's queue was full
    pub messages_dropped: IntCounter,
    /// Unique message bodies currently registered
    pub store_messages: IntGauge,
    /// Payload bytes currently registered
    pub store_bytes: IntGauge,
    /// Delivery records currently inflight, by direction
    pub inflight_messages: IntGaugeVec,
    /// Delivery records currently queued for window space, by direction
    pub queued_messages: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_sent = IntCounter::with_opts(Opts::new(
            "fluxmq_messages_sent_total",
            "Total messages handed to sessions for delivery",
        ))
        .unwrap();

        let messages_dropped = IntCounter::with_opts(Opts::new(
            "fluxmq_messages_dropped_total",
            "Total messages dropped due to full session queues",
        ))
        .unwrap();

        let store_messages = IntGauge::with_opts(Opts::new(
            "fluxmq_store_messages_current",
            "Unique message bodies currently in the store",
        ))
        .unwrap();

        let store_bytes = IntGauge::with_opts(Opts::new(
            "fluxmq_store_bytes_current",
            "Payload bytes currently in the store",
        ))
        .unwrap();

        let inflight_messages = IntGaugeVec::new(
            Opts::new(
                "fluxmq_inflight_messages",
                "Delivery records currently inflight, by direction",
            ),
            &["direction"],
        )
        .unwrap();

        let queued_messages = IntGaugeVec::new(
            Opts::new(
                "fluxmq_queued_messages",
                "Delivery records awaiting window space, by direction",
            ),
            &["direction"],
        )
        .unwrap();

        registry.register(Box::new(messages_sent.clone())).unwrap();
        registry.register(Box::new(messages_dropped.clone())).unwrap();
        registry.register(Box::new(store_messages.clone())).unwrap();
        registry.register(Box::new(store_bytes.clone())).unwrap();
        registry.register(Box::new(inflight_messages.clone())).unwrap();
        registry.register(Box::new(queued_messages.clone())).unwrap();

        Self {
            registry,
            messages_sent,
            messages_dropped,
            store_messages,
            store_bytes,
            inflight_messages,
            queued_messages,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_count() {
        let metrics = Metrics::new();
        metrics.messages_sent.inc();
        metrics.messages_dropped.inc();
        metrics.store_messages.set(3);
        metrics.store_bytes.set(42);
        metrics.inflight_messages.with_label_values(&["out"]).inc();
        metrics.queued_messages.with_label_values(&["in"]).set(2);

        assert_eq!(metrics.messages_sent.get(), 1);
        assert_eq!(metrics.messages_dropped.get(), 1);
        assert_eq!(metrics.store_messages.get(), 3);
        assert_eq!(metrics.store_bytes.get(), 42);
        assert_eq!(metrics.inflight_messages.with_label_values(&["out"]).get(), 1);
        assert_eq!(metrics.queued_messages.with_label_values(&["in"]).get(), 2);
        assert_eq!(metrics.registry.gather().len(), 6);
    }
}
