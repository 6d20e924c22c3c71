//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Client messaging contract over the mqbridge transport.
//!
//! A [`Connection`] owns sessions. Each [`Session`] owns an acknowledgement
//! ledger shared by the consumers and producers it created, and decides when
//! ledger entries are cleared according to its [`AcknowledgeMode`]. Durable
//! consumers consult the connection's subscription store so that an
//! acknowledged message identifier never reaches the application twice.
#![warn(missing_docs)]

use mqbridge_durable::StoreError;
use mqbridge_transport::{Destination, TransportError};

pub mod connection;
pub mod consumer;
mod ledger;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod selector;
pub mod session;

/// Result alias used across the session core.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised by connections, sessions, consumers, and producers.
///
/// Usage errors carry the exact text of the client messaging contract.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Delivery mode outside `{PERSISTENT, NON_PERSISTENT}`.
    #[error("Illegal deliveryMode: {0}.")]
    IllegalDeliveryMode(i32),
    /// Priority outside `0..=9`.
    #[error("Illegal priority: {0}.")]
    IllegalPriority(i32),
    /// Negative time to live.
    #[error("Illegal timeToLive: {0}.")]
    IllegalTimeToLive(i64),
    /// Bound-destination send on an unbound producer.
    #[error("This MessageProducer is created without a Destination.")]
    ProducerWithoutDestination,
    /// Explicit-destination send on a bound producer.
    #[error("This MessageProducer is created with a Destination.")]
    ProducerWithDestination,
    /// Producer used after close.
    #[error("This MessageProducer is closed.")]
    ProducerClosed,
    /// Consumer used after close.
    #[error("This MessageConsumer is closed.")]
    ConsumerClosed,
    /// Synchronous receive while asynchronous delivery is enabled.
    #[error("A MessageListener is set on this MessageConsumer.")]
    ListenerActive,
    /// Session used after close.
    #[error("This Session is closed.")]
    SessionClosed,
    /// Connection used after close.
    #[error("This Connection is closed.")]
    ConnectionClosed,
    /// Durable subscription name held by an open consumer.
    #[error("Durable subscription {0} is in use.")]
    SubscriptionInUse(String),
    /// Durable subscription exists with different parameters.
    #[error("Durable subscription {name} is in use with different parameters: {reason}.")]
    SubscriptionMismatch {
        /// Subscription name.
        name: String,
        /// Which parameter differs.
        reason: String,
    },
    /// Unsubscribe of a name with no record.
    #[error("Durable subscription {0} does not exist.")]
    UnknownSubscription(String),
    /// Durable operations need a client identity on the connection.
    #[error("A client identity is required for durable subscriptions.")]
    MissingClientId,
    /// Durable consumers can only be created on topics.
    #[error("Durable subscriptions require a topic, got {0}.")]
    NotATopic(Destination),
    /// A selector was supplied but no evaluator is configured.
    #[error("Message selectors are not supported by this connection.")]
    SelectorUnsupported,
    /// The selector evaluator rejected a selector or failed to evaluate it.
    #[error("Invalid selector: {0}")]
    Selector(String),
    /// Send or subscribe failure from the transport binding.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Durable store failure during duplicate check or acknowledgement.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    /// Message content could not be encoded or decoded.
    #[error("message format error: {0}")]
    Format(#[from] serde_cbor::Error),
    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub use connection::{Connection, ConnectionBuilder, ExceptionListener};
pub use consumer::{MessageConsumer, MessageListener};
pub use message::{Message, MessageBody, PropertyValue};
pub use metrics::BridgeMetrics;
pub use producer::MessageProducer;
pub use selector::SelectorEvaluator;
pub use session::{AcknowledgeMode, Session};

pub use mqbridge_transport::{DeliveryMode, MessageId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_render_contract_text() {
        assert_eq!(
            BridgeError::IllegalDeliveryMode(0).to_string(),
            "Illegal deliveryMode: 0."
        );
        assert_eq!(
            BridgeError::IllegalPriority(10).to_string(),
            "Illegal priority: 10."
        );
        assert_eq!(
            BridgeError::IllegalTimeToLive(-1).to_string(),
            "Illegal timeToLive: -1."
        );
        assert_eq!(
            BridgeError::ProducerClosed.to_string(),
            "This MessageProducer is closed."
        );
        assert_eq!(
            BridgeError::ConsumerClosed.to_string(),
            "This MessageConsumer is closed."
        );
    }
}
