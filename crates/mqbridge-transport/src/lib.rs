//! ---
//! mqb_section: "02-transport-boundary"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Transport handles, samples, and provider registry."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Transport boundary for mqbridge.
//!
//! The underlying publish/subscribe layer only promises unordered,
//! at-least-once delivery of samples to whichever readers are attached. This
//! crate describes that contract as a pair of handle traits and ships an
//! in-memory topic transport used by tests and single-process deployments.
#![warn(missing_docs)]

pub mod memory;
pub mod registry;
pub mod transport;
pub mod types;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by transport bindings.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Raised when publishing through a handle that has been closed.
    #[error("publish handle for {0} is closed")]
    PublisherClosed(types::Destination),
    /// Raised when a durable subscription is requested on a queue.
    #[error("durable subscriptions require a topic destination, got {0}")]
    DurableRequiresTopic(types::Destination),
    /// Raised when the registry has no provider under the requested name.
    #[error("unknown transport kind: {0}")]
    UnknownKind(String),
    /// Raised by bindings that cannot reach their backing medium.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

pub use memory::InMemoryTransport;
pub use registry::TransportRegistry;
pub use transport::{
    PublishHandle, SampleCallback, SubscribeHandle, SubscriberSpec, TransportBinding,
};
pub use types::{
    ClientId, ConnectionId, DeliveryMode, Destination, MessageId, OutboundSample, Sample,
    SubscriptionKey,
};
