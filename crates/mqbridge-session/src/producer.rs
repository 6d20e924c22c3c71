//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mqbridge_logging::{bridge_debug, LogContext};
use mqbridge_transport::{DeliveryMode, Destination, MessageId, OutboundSample, PublishHandle};
use parking_lot::Mutex;

use crate::connection::ConnectionShared;
use crate::message::{Message, DEFAULT_PRIORITY};
use crate::session::SessionShared;
use crate::{BridgeError, Result};

const MAX_PRIORITY: i32 = 9;

#[derive(Debug, Clone, Copy)]
struct SendSettings {
    delivery_mode: DeliveryMode,
    priority: u8,
    time_to_live: u64,
}

impl SendSettings {
    fn validate(delivery_mode: i32, priority: i32, time_to_live: i64) -> Result<Self> {
        Ok(Self {
            delivery_mode: check_delivery_mode(delivery_mode)?,
            priority: check_priority(priority)?,
            time_to_live: check_time_to_live(time_to_live)?,
        })
    }
}

fn check_delivery_mode(raw: i32) -> Result<DeliveryMode> {
    DeliveryMode::from_raw(raw).ok_or(BridgeError::IllegalDeliveryMode(raw))
}

fn check_priority(raw: i32) -> Result<u8> {
    if !(0..=MAX_PRIORITY).contains(&raw) {
        return Err(BridgeError::IllegalPriority(raw));
    }
    u8::try_from(raw).map_err(|_| BridgeError::IllegalPriority(raw))
}

fn check_time_to_live(raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| BridgeError::IllegalTimeToLive(raw))
}

/// Sends messages to a bound destination, or to one named per call.
///
/// Arguments are validated when the call is made, before anything reaches
/// the transport.
#[derive(Clone)]
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    session_id: String,
    connection: Arc<ConnectionShared>,
    destination: Option<Destination>,
    bound: Option<Arc<dyn PublishHandle>>,
    unbound: Mutex<HashMap<Destination, Arc<dyn PublishHandle>>>,
    defaults: Mutex<SendSettings>,
    closed: AtomicBool,
}

impl MessageProducer {
    pub(crate) fn open(
        session: &Arc<SessionShared>,
        destination: Option<Destination>,
    ) -> Result<Self> {
        let connection = Arc::clone(&session.connection);
        let bound = destination
            .as_ref()
            .map(|destination| connection.transport.publisher(destination))
            .transpose()?;
        Ok(Self {
            inner: Arc::new(ProducerInner {
                session_id: session.id.clone(),
                connection,
                destination,
                bound,
                unbound: Mutex::new(HashMap::new()),
                defaults: Mutex::new(SendSettings {
                    delivery_mode: DeliveryMode::Persistent,
                    priority: DEFAULT_PRIORITY,
                    time_to_live: 0,
                }),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Destination bound at creation.
    pub fn destination(&self) -> Option<&Destination> {
        self.inner.destination.as_ref()
    }

    /// Whether [`MessageProducer::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::ProducerClosed);
        }
        Ok(())
    }

    /// Default delivery mode; accepts a [`DeliveryMode`] or its raw value.
    pub fn set_delivery_mode(&self, delivery_mode: impl Into<i32>) -> Result<()> {
        self.ensure_open()?;
        let mode = check_delivery_mode(delivery_mode.into())?;
        self.inner.defaults.lock().delivery_mode = mode;
        Ok(())
    }

    /// Default delivery mode.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.inner.defaults.lock().delivery_mode
    }

    /// Default priority, `0..=9`.
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        self.ensure_open()?;
        let priority = check_priority(priority)?;
        self.inner.defaults.lock().priority = priority;
        Ok(())
    }

    /// Default priority.
    pub fn priority(&self) -> i32 {
        i32::from(self.inner.defaults.lock().priority)
    }

    /// Default time to live in milliseconds; `0` means unlimited.
    pub fn set_time_to_live(&self, time_to_live: i64) -> Result<()> {
        self.ensure_open()?;
        let time_to_live = check_time_to_live(time_to_live)?;
        self.inner.defaults.lock().time_to_live = time_to_live;
        Ok(())
    }

    /// Default time to live in milliseconds.
    pub fn time_to_live(&self) -> i64 {
        i64::try_from(self.inner.defaults.lock().time_to_live).unwrap_or(i64::MAX)
    }

    /// Accepted for compatibility. Identifiers are always assigned.
    pub fn set_disable_message_id(&self, _disable: bool) -> Result<()> {
        self.ensure_open()
    }

    /// Always `false`.
    pub fn disable_message_id(&self) -> bool {
        false
    }

    /// Accepted for compatibility. Timestamps are always assigned.
    pub fn set_disable_message_timestamp(&self, _disable: bool) -> Result<()> {
        self.ensure_open()
    }

    /// Always `false`.
    pub fn disable_message_timestamp(&self) -> bool {
        false
    }

    /// Send to the bound destination with the producer defaults.
    pub fn send(&self, message: &Message) -> Result<MessageId> {
        self.ensure_open()?;
        let handle = self.bound_handle()?;
        let settings = *self.inner.defaults.lock();
        self.publish(&handle, message, settings)
    }

    /// Send to the bound destination with explicit delivery parameters.
    pub fn send_with(
        &self,
        message: &Message,
        delivery_mode: impl Into<i32>,
        priority: i32,
        time_to_live: i64,
    ) -> Result<MessageId> {
        self.ensure_open()?;
        let handle = self.bound_handle()?;
        let settings = SendSettings::validate(delivery_mode.into(), priority, time_to_live)?;
        self.publish(&handle, message, settings)
    }

    /// Send to `destination` with the producer defaults. Unbound producers only.
    pub fn send_to(&self, destination: &Destination, message: &Message) -> Result<MessageId> {
        self.ensure_open()?;
        let handle = self.unbound_handle(destination)?;
        let settings = *self.inner.defaults.lock();
        self.publish(&handle, message, settings)
    }

    /// Send to `destination` with explicit delivery parameters. Unbound producers only.
    pub fn send_to_with(
        &self,
        destination: &Destination,
        message: &Message,
        delivery_mode: impl Into<i32>,
        priority: i32,
        time_to_live: i64,
    ) -> Result<MessageId> {
        self.ensure_open()?;
        if self.inner.destination.is_some() {
            return Err(BridgeError::ProducerWithDestination);
        }
        let settings = SendSettings::validate(delivery_mode.into(), priority, time_to_live)?;
        let handle = self.unbound_handle(destination)?;
        self.publish(&handle, message, settings)
    }

    /// Release transport handles. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = &self.inner.bound {
            handle.close();
        }
        for handle in self.inner.unbound.lock().drain().map(|(_, handle)| handle) {
            handle.close();
        }
        bridge_debug!(
            context = LogContext::new().with_session(&self.inner.session_id),
            "producer closed"
        );
    }

    fn bound_handle(&self) -> Result<Arc<dyn PublishHandle>> {
        self.inner
            .bound
            .clone()
            .ok_or(BridgeError::ProducerWithoutDestination)
    }

    fn unbound_handle(&self, destination: &Destination) -> Result<Arc<dyn PublishHandle>> {
        if self.inner.destination.is_some() {
            return Err(BridgeError::ProducerWithDestination);
        }
        let mut handles = self.inner.unbound.lock();
        if let Some(handle) = handles.get(destination) {
            return Ok(Arc::clone(handle));
        }
        let handle = self.inner.connection.transport.publisher(destination)?;
        handles.insert(destination.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    fn publish(
        &self,
        handle: &Arc<dyn PublishHandle>,
        message: &Message,
        settings: SendSettings,
    ) -> Result<MessageId> {
        let id = handle.send(OutboundSample {
            payload: message.encode()?,
            delivery_mode: settings.delivery_mode,
            priority: settings.priority,
            time_to_live: settings.time_to_live,
            origin: self.inner.connection.id,
        })?;
        let destination = handle.destination().to_string();
        if let Some(metrics) = &self.inner.connection.metrics {
            metrics.record_sent(&destination);
        }
        bridge_debug!(
            context = LogContext::new()
                .with_session(&self.inner.session_id)
                .with_destination(&destination),
            "sent message {}",
            id
        );
        Ok(id)
    }
}

impl fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProducer")
            .field("session", &self.inner.session_id)
            .field("destination", &self.inner.destination)
            .field("defaults", &*self.inner.defaults.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::session::AcknowledgeMode;
    use mqbridge_transport::InMemoryTransport;

    fn producer(destination: Option<&Destination>) -> (Connection, MessageProducer) {
        let connection = Connection::builder(Arc::new(InMemoryTransport::new())).build();
        let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
        let producer = session.create_producer(destination).unwrap();
        (connection, producer)
    }

    #[test]
    fn defaults_match_contract() {
        let (_connection, producer) = producer(None);
        assert_eq!(producer.delivery_mode(), DeliveryMode::Persistent);
        assert_eq!(producer.priority(), 4);
        assert_eq!(producer.time_to_live(), 0);
        assert!(producer.destination().is_none());
    }

    #[test]
    fn disable_hints_always_read_false() {
        let (_connection, producer) = producer(None);
        producer.set_disable_message_id(true).unwrap();
        producer.set_disable_message_timestamp(true).unwrap();
        assert!(!producer.disable_message_id());
        assert!(!producer.disable_message_timestamp());
    }

    #[test]
    fn send_with_validates_before_publishing() {
        let queue = Destination::queue("q");
        let (_connection, producer) = producer(Some(&queue));
        let message = Message::text("m");
        assert_eq!(
            producer.send_with(&message, 3, 4, 0).unwrap_err().to_string(),
            "Illegal deliveryMode: 3."
        );
        assert_eq!(
            producer
                .send_with(&message, DeliveryMode::Persistent, -1, 0)
                .unwrap_err()
                .to_string(),
            "Illegal priority: -1."
        );
        assert_eq!(
            producer
                .send_with(&message, DeliveryMode::NonPersistent, 9, -5)
                .unwrap_err()
                .to_string(),
            "Illegal timeToLive: -5."
        );
        producer
            .send_with(&message, DeliveryMode::NonPersistent, 0, 1_000)
            .unwrap();
    }

    #[test]
    fn unbound_producer_caches_handles() {
        let (_connection, producer) = producer(None);
        let a = Destination::topic("a");
        producer.send_to(&a, &Message::text("1")).unwrap();
        producer.send_to(&a, &Message::text("2")).unwrap();
        producer
            .send_to(&Destination::queue("b"), &Message::text("3"))
            .unwrap();
        assert_eq!(producer.inner.unbound.lock().len(), 2);

        producer.close();
        assert!(producer.inner.unbound.lock().is_empty());
    }
}
