//! ---
//! mqb_section: "05-observability"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Prometheus counters for message flow and acknowledgement."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use prometheus::{self, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by connections and everything they create.
#[derive(Clone)]
pub struct BridgeMetrics {
    sent: IntCounterVec,
    received: IntCounterVec,
    acknowledged: IntCounter,
    duplicates: IntCounter,
    persistence_failures: IntCounter,
    receive_wait: Histogram,
    registry: Arc<Registry>,
}

impl BridgeMetrics {
    /// Register all bridge metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let sent = IntCounterVec::new(
            Opts::new(
                "mqbridge_messages_sent_total",
                "Messages handed to the transport by producers",
            ),
            &["destination"],
        )?;
        registry.register(Box::new(sent.clone()))?;

        let received = IntCounterVec::new(
            Opts::new(
                "mqbridge_messages_received_total",
                "Messages delivered to the application by consumers",
            ),
            &["destination"],
        )?;
        registry.register(Box::new(received.clone()))?;

        let acknowledged = IntCounter::new(
            "mqbridge_messages_acknowledged_total",
            "Ledger entries cleared by acknowledgement",
        )?;
        registry.register(Box::new(acknowledged.clone()))?;

        let duplicates = IntCounter::new(
            "mqbridge_duplicates_suppressed_total",
            "Durable redeliveries discarded as already acknowledged",
        )?;
        registry.register(Box::new(duplicates.clone()))?;

        let persistence_failures = IntCounter::new(
            "mqbridge_persistence_failures_total",
            "Subscription store failures during duplicate checks or acknowledgement",
        )?;
        registry.register(Box::new(persistence_failures.clone()))?;

        let receive_wait = Histogram::with_opts(
            HistogramOpts::new(
                "mqbridge_receive_wait_seconds",
                "Time synchronous receive calls spent waiting for a message",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 2.0, 16)?),
        )?;
        registry.register(Box::new(receive_wait.clone()))?;

        Ok(Self {
            sent,
            received,
            acknowledged,
            duplicates,
            persistence_failures,
            receive_wait,
            registry,
        })
    }

    /// Metrics backed by a private registry.
    pub fn standalone() -> Result<Self> {
        Self::new(Arc::new(Registry::new()))
    }

    /// Registry the metrics were registered with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn record_sent(&self, destination: &str) {
        self.sent.with_label_values(&[destination]).inc();
    }

    pub(crate) fn record_received(&self, destination: &str) {
        self.received.with_label_values(&[destination]).inc();
    }

    pub(crate) fn record_acknowledged(&self) {
        self.acknowledged.inc();
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.inc();
    }

    pub(crate) fn record_persistence_failure(&self) {
        self.persistence_failures.inc();
    }

    pub(crate) fn observe_receive_wait(&self, waited: Duration) {
        self.receive_wait.observe(waited.as_secs_f64());
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMetrics").finish_non_exhaustive()
    }
}
