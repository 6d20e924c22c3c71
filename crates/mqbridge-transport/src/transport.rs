//! ---
//! mqb_section: "02-transport-boundary"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Transport handles, samples, and provider registry."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::sync::Arc;

use crate::types::{ConnectionId, Destination, MessageId, OutboundSample, Sample, SubscriptionKey};
use crate::Result;

/// Callback invoked by the transport for every sample pushed to a subscriber.
pub type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;

/// Parameters describing the reader attached by [`TransportBinding::subscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberSpec {
    /// Connection the reader belongs to.
    pub connection: ConnectionId,
    /// Durable identity; samples keep queueing while no reader is attached.
    pub durable: Option<SubscriptionKey>,
}

impl SubscriberSpec {
    /// Spec for a reader that only sees samples while attached.
    pub fn transient(connection: ConnectionId) -> Self {
        Self {
            connection,
            durable: None,
        }
    }

    /// Spec for a reader bound to a durable transport-side queue.
    pub fn durable(connection: ConnectionId, key: SubscriptionKey) -> Self {
        Self {
            connection,
            durable: Some(key),
        }
    }
}

/// A transport kind able to hand out publish and subscribe handles.
pub trait TransportBinding: Send + Sync {
    /// Provider name used for logging and registry lookup.
    fn name(&self) -> &'static str;
    /// Obtain a handle publishing to `destination`.
    fn publisher(&self, destination: &Destination) -> Result<Arc<dyn PublishHandle>>;
    /// Attach a reader to `destination`.
    fn subscriber(
        &self,
        destination: &Destination,
        spec: SubscriberSpec,
    ) -> Result<Arc<dyn SubscribeHandle>>;
    /// Discard the transport-side queue of a durable subscription.
    ///
    /// Returns `false` when no such queue existed.
    fn remove_durable(&self, key: &SubscriptionKey) -> Result<bool>;
}

/// Writer side of a destination.
pub trait PublishHandle: Send + Sync {
    /// Destination samples are written to.
    fn destination(&self) -> &Destination;
    /// Publish a sample and return the identifier the transport assigned.
    fn send(&self, sample: OutboundSample) -> Result<MessageId>;
    /// Release the handle. Idempotent.
    fn close(&self);
}

/// Reader side of a destination.
///
/// Samples are pushed to the registered callback when one is installed and
/// buffered for [`SubscribeHandle::take_next`] otherwise.
pub trait SubscribeHandle: Send + Sync {
    /// Destination the reader is attached to.
    fn destination(&self) -> &Destination;
    /// Install or clear the push callback. Installing flushes buffered samples in order.
    fn on_message(&self, callback: Option<SampleCallback>);
    /// Pop the next buffered sample without blocking.
    fn take_next(&self) -> Option<Sample>;
    /// Detach the reader, handing back samples it took but did not consume.
    ///
    /// Durable and queue readers keep them for the next reader, ahead of newer
    /// samples. Topic readers drop them. Idempotent.
    fn close_returning(&self, unconsumed: Vec<Sample>);
    /// Detach the reader. Idempotent.
    fn close(&self) {
        self.close_returning(Vec::new());
    }
}
