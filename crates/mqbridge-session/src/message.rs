//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Application-facing message type and its CBOR encoding on the transport.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mqbridge_transport::{DeliveryMode, Destination, MessageId, Sample};
use serde::{Deserialize, Serialize};

use crate::session::SessionShared;
use crate::{BridgeError, Result};

/// Default priority used by producers and fresh messages.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// No body.
    #[default]
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

/// Typed application property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    /// Boolean property.
    Bool(bool),
    /// 32-bit integer property.
    Int(i32),
    /// 64-bit integer property.
    Long(i64),
    /// Floating point property.
    Double(f64),
    /// String property.
    String(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

// Wire form. Header fields travel as transport metadata instead.
#[derive(Serialize, Deserialize)]
struct Content<'a> {
    body: std::borrow::Cow<'a, MessageBody>,
    #[serde(default)]
    properties: std::borrow::Cow<'a, BTreeMap<String, PropertyValue>>,
}

/// A message sent through a producer or handed out by a consumer.
///
/// Header fields (`id`, `destination`, `timestamp`, ...) are only populated
/// on received messages.
#[derive(Clone, Default)]
pub struct Message {
    body: MessageBody,
    properties: BTreeMap<String, PropertyValue>,
    id: Option<MessageId>,
    destination: Option<Destination>,
    timestamp: Option<DateTime<Utc>>,
    delivery_mode: DeliveryMode,
    priority: u8,
    expiration: Option<DateTime<Utc>>,
    redelivered: bool,
    ack: Option<AckHandle>,
}

impl Message {
    /// Message with the given body.
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            priority: DEFAULT_PRIORITY,
            ..Self::default()
        }
    }

    /// Text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(text.into()))
    }

    /// Bytes message.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageBody::Bytes(bytes.into()))
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Set or replace a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Look up a property.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// All properties, ordered by name.
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Message body.
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Body text, if this is a text message.
    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Transport-assigned identifier of a received message.
    pub fn id(&self) -> Option<&MessageId> {
        self.id.as_ref()
    }

    /// Destination a received message was published to.
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Time the transport accepted the message.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Delivery mode the message was sent with.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Priority the message was sent with.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Expiration time, `None` when the message never expires.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Whether the message was delivered before, to this or another consumer.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the session this message was received through.
    ///
    /// In CLIENT mode every unacknowledged delivery of the session is
    /// acknowledged, not only this message. A no-op for messages that were
    /// not received and for AUTO and DUPS_OK sessions.
    pub fn acknowledge(&self) -> Result<()> {
        match &self.ack {
            Some(handle) => handle.acknowledge(),
            None => Ok(()),
        }
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        let content = Content {
            body: std::borrow::Cow::Borrowed(&self.body),
            properties: std::borrow::Cow::Borrowed(&self.properties),
        };
        Ok(Bytes::from(serde_cbor::to_vec(&content)?))
    }

    pub(crate) fn from_sample(sample: &Sample) -> Result<Self> {
        let content: Content<'static> = serde_cbor::from_slice(&sample.payload)?;
        Ok(Self {
            body: content.body.into_owned(),
            properties: content.properties.into_owned(),
            id: Some(sample.id.clone()),
            destination: Some(sample.destination.clone()),
            timestamp: Some(sample.published_at),
            delivery_mode: sample.delivery_mode,
            priority: sample.priority,
            expiration: sample.expires_at,
            redelivered: sample.redelivered(),
            ack: None,
        })
    }

    pub(crate) fn attach(&mut self, handle: AckHandle) {
        self.ack = Some(handle);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("body", &self.body)
            .field("properties", &self.properties)
            .field("delivery_mode", &self.delivery_mode)
            .field("priority", &self.priority)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Link from a received message back to its session.
#[derive(Clone)]
pub(crate) struct AckHandle {
    session: Weak<SessionShared>,
}

impl AckHandle {
    pub(crate) fn new(session: Weak<SessionShared>) -> Self {
        Self { session }
    }

    fn acknowledge(&self) -> Result<()> {
        self.session
            .upgrade()
            .ok_or(BridgeError::SessionClosed)?
            .acknowledge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqbridge_transport::{ConnectionId, OutboundSample};

    fn sample_of(message: &Message) -> Sample {
        Sample::from_outbound(
            Destination::topic("prices"),
            OutboundSample {
                payload: message.encode().unwrap(),
                delivery_mode: DeliveryMode::NonPersistent,
                priority: 7,
                time_to_live: 60_000,
                origin: ConnectionId::generate(),
            },
        )
    }

    #[test]
    fn decoded_message_carries_transport_headers() {
        let sent = Message::text("tick")
            .with_property("symbol", "ACME")
            .with_property("level", 3)
            .with_property("final", true);
        let sample = sample_of(&sent);

        let received = Message::from_sample(&sample).unwrap();
        assert_eq!(received.text_body(), Some("tick"));
        assert_eq!(
            received.property("symbol"),
            Some(&PropertyValue::String("ACME".into()))
        );
        assert_eq!(received.property("level"), Some(&PropertyValue::Int(3)));
        assert_eq!(received.id(), Some(&sample.id));
        assert_eq!(received.destination(), Some(&Destination::topic("prices")));
        assert_eq!(received.delivery_mode(), DeliveryMode::NonPersistent);
        assert_eq!(received.priority(), 7);
        assert!(received.expiration().is_some());
        assert!(!received.redelivered());

        let again = Message::from_sample(&sample.redelivery()).unwrap();
        assert!(again.redelivered());
    }

    #[test]
    fn garbage_payload_is_a_format_error() {
        let mut sample = sample_of(&Message::bytes(vec![1, 2, 3]));
        sample.payload = Bytes::from_static(b"\xff\x00not cbor");
        assert!(matches!(
            Message::from_sample(&sample),
            Err(BridgeError::Format(_))
        ));
    }

    #[test]
    fn unreceived_message_acknowledge_is_noop() {
        let message = Message::text("draft");
        assert!(message.id().is_none());
        assert_eq!(message.priority(), DEFAULT_PRIORITY);
        message.acknowledge().unwrap();
    }

    #[test]
    fn orphaned_ack_handle_reports_closed_session() {
        let mut message = Message::text("late");
        message.attach(AckHandle::new(Weak::new()));
        assert!(matches!(
            message.acknowledge(),
            Err(BridgeError::SessionClosed)
        ));
    }
}
