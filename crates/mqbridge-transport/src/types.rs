//! ---
//! mqb_section: "02-transport-boundary"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Transport handles, samples, and provider registry."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named endpoint a sample is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Destination {
    /// Point-to-point: each sample reaches exactly one attached reader.
    Queue(String),
    /// Publish/subscribe: each sample reaches every attached reader.
    Topic(String),
}

impl Destination {
    /// Construct a queue destination.
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    /// Construct a topic destination.
    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    /// Bare destination name without the kind prefix.
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    /// Whether the destination has topic semantics.
    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

/// Per-message durability hint handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The sample may be lost if the transport restarts.
    NonPersistent,
    /// The sample should survive a transport restart.
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// Wire value of [`DeliveryMode::NonPersistent`].
    pub const NON_PERSISTENT: i32 = 1;
    /// Wire value of [`DeliveryMode::Persistent`].
    pub const PERSISTENT: i32 = 2;

    /// Decode a wire value, returning `None` for anything unknown.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            Self::NON_PERSISTENT => Some(DeliveryMode::NonPersistent),
            Self::PERSISTENT => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }

    /// Wire value for this mode.
    pub fn as_raw(self) -> i32 {
        match self {
            DeliveryMode::NonPersistent => Self::NON_PERSISTENT,
            DeliveryMode::Persistent => Self::PERSISTENT,
        }
    }
}

impl From<DeliveryMode> for i32 {
    fn from(mode: DeliveryMode) -> Self {
        mode.as_raw()
    }
}

/// Transport-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("ID:{}", Uuid::new_v4()))
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application-chosen client identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap a client identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-unique identity of one connection, stamped on every sample it publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh connection identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a durable subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Client identity owning the subscription.
    pub client_id: ClientId,
    /// Subscription name chosen by the application.
    pub name: String,
}

impl SubscriptionKey {
    /// Construct a key from its parts.
    pub fn new(client_id: ClientId, name: impl Into<String>) -> Self {
        Self {
            client_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.name)
    }
}

/// Payload and delivery parameters handed to a publish handle.
#[derive(Debug, Clone)]
pub struct OutboundSample {
    /// Encoded message content.
    pub payload: Bytes,
    /// Durability hint.
    pub delivery_mode: DeliveryMode,
    /// Priority in `0..=9`.
    pub priority: u8,
    /// Time to live in milliseconds, `0` meaning unlimited.
    pub time_to_live: u64,
    /// Connection that published the sample.
    pub origin: ConnectionId,
}

/// A data sample as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Transport-assigned identifier, stable across redeliveries.
    pub id: MessageId,
    /// Destination the sample was published to.
    pub destination: Destination,
    /// Encoded message content.
    pub payload: Bytes,
    /// Connection that published the sample.
    pub origin: ConnectionId,
    /// Durability hint.
    pub delivery_mode: DeliveryMode,
    /// Priority in `0..=9`.
    pub priority: u8,
    /// Time the transport accepted the sample.
    pub published_at: DateTime<Utc>,
    /// Time after which the sample should no longer be handed to applications.
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of times this sample has been delivered, starting at 1.
    pub delivery_count: u32,
}

impl Sample {
    /// Stamp an outbound sample with transport metadata.
    pub fn from_outbound(destination: Destination, outbound: OutboundSample) -> Self {
        let published_at = Utc::now();
        let expires_at = (outbound.time_to_live > 0).then(|| {
            published_at
                + ChronoDuration::milliseconds(
                    i64::try_from(outbound.time_to_live).unwrap_or(i64::MAX),
                )
        });
        Self {
            id: MessageId::generate(),
            destination,
            payload: outbound.payload,
            origin: outbound.origin,
            delivery_mode: outbound.delivery_mode,
            priority: outbound.priority,
            published_at,
            expires_at,
            delivery_count: 1,
        }
    }

    /// Whether the time to live elapsed before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Whether this is not the first delivery of the sample.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    /// Copy of the sample marked as delivered once more.
    pub fn redelivery(&self) -> Self {
        let mut sample = self.clone();
        sample.delivery_count = sample.delivery_count.saturating_add(1);
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(ttl: u64) -> OutboundSample {
        OutboundSample {
            payload: Bytes::from_static(b"m1"),
            delivery_mode: DeliveryMode::Persistent,
            priority: 4,
            time_to_live: ttl,
            origin: ConnectionId::generate(),
        }
    }

    #[test]
    fn delivery_mode_wire_values() {
        assert_eq!(DeliveryMode::from_raw(2), Some(DeliveryMode::Persistent));
        assert_eq!(DeliveryMode::from_raw(1), Some(DeliveryMode::NonPersistent));
        assert_eq!(DeliveryMode::from_raw(0), None);
        assert_eq!(i32::from(DeliveryMode::NonPersistent), 1);
    }

    #[test]
    fn destination_display_and_serde() {
        let topic = Destination::topic("prices");
        assert_eq!(topic.to_string(), "topic://prices");
        assert!(topic.is_topic());

        let json = serde_json::to_string(&Destination::queue("orders")).unwrap();
        assert_eq!(json, r#"{"kind":"queue","name":"orders"}"#);
    }

    #[test]
    fn ttl_sets_expiration() {
        let sample = Sample::from_outbound(Destination::topic("t"), outbound(0));
        assert!(sample.expires_at.is_none());
        assert!(!sample.is_expired(Utc::now()));

        let sample = Sample::from_outbound(Destination::topic("t"), outbound(5));
        let later = sample.published_at + ChronoDuration::milliseconds(10);
        assert!(sample.is_expired(later));
    }

    #[test]
    fn redelivery_increments_count() {
        let sample = Sample::from_outbound(Destination::topic("t"), outbound(0));
        assert!(!sample.redelivered());
        let again = sample.redelivery();
        assert_eq!(again.id, sample.id);
        assert!(again.redelivered());
    }
}
