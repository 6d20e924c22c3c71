//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Sessions: acknowledgement-mode enforcement and child lifecycle.
//!
//! A session and its children are confined to one logical thread of control
//! at a time. Deliveries to listeners still arrive on transport threads, so
//! the ledger and the child lists are guarded internally.
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mqbridge_durable::{StoreError, SubscriptionInfo};
use mqbridge_logging::{
    bridge_debug, bridge_info, bridge_warn, log_lifecycle_event, LifecycleOutcome, LogContext,
};
use mqbridge_transport::{Destination, Sample, SubscriberSpec, SubscriptionKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionShared;
use crate::consumer::{ConsumerSettings, MessageConsumer};
use crate::ledger::{ConsumerSeq, Ledger, LedgerEntry};
use crate::message::{AckHandle, Message};
use crate::producer::MessageProducer;
use crate::{BridgeError, Result};

/// How deliveries of a session are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcknowledgeMode {
    /// Each delivery is acknowledged before it is handed to the application.
    Auto,
    /// Deliveries stay unacknowledged until the application acknowledges.
    Client,
    /// Deliveries are acknowledged lazily, in batches. Duplicates are tolerated.
    DupsOk,
}

impl AcknowledgeMode {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AcknowledgeMode::Auto => "auto",
            AcknowledgeMode::Client => "client",
            AcknowledgeMode::DupsOk => "dups-ok",
        }
    }
}

impl fmt::Display for AcknowledgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcknowledgeMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" | "auto_acknowledge" => Ok(AcknowledgeMode::Auto),
            "client" | "client_acknowledge" => Ok(AcknowledgeMode::Client),
            "dups-ok" | "dups_ok" | "dups_ok_acknowledge" => Ok(AcknowledgeMode::DupsOk),
            other => Err(format!("unknown acknowledge mode: {other}")),
        }
    }
}

/// A single unit of work owning an acknowledgement mode, a ledger, and the
/// consumers and producers created from it.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn open(connection: Arc<ConnectionShared>, mode: AcknowledgeMode) -> Self {
        let shared = Arc::new(SessionShared {
            id: format!("session-{}", Uuid::new_v4().simple()),
            mode,
            connection,
            ledger: Ledger::default(),
            closed: AtomicBool::new(false),
            children: Mutex::new(Children::default()),
            next_consumer: AtomicU64::new(1),
        });
        log_lifecycle_event(
            Some(&LogContext::new().with_session(&shared.id)),
            "session.open",
            &format!("session opened in {mode} mode"),
            LifecycleOutcome::Success,
        );
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionShared> {
        Arc::downgrade(&self.shared)
    }

    /// Session identifier used in logs.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Acknowledgement mode chosen at creation.
    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.shared.mode
    }

    /// Whether the session, or its connection, was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Create a producer bound to `destination`, or an unbound one when `None`.
    pub fn create_producer(&self, destination: Option<&Destination>) -> Result<MessageProducer> {
        self.shared.ensure_open()?;
        let producer = MessageProducer::open(&self.shared, destination.cloned())?;
        let mut children = self.shared.children.lock();
        children.producers.retain(|existing| !existing.is_closed());
        children.producers.push(producer.clone());
        Ok(producer)
    }

    /// Create a consumer on `destination` without selector or no-local filtering.
    pub fn create_consumer(&self, destination: &Destination) -> Result<MessageConsumer> {
        self.create_consumer_with(destination, None, false)
    }

    /// Create a consumer with an optional selector and the no-local flag.
    pub fn create_consumer_with(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<MessageConsumer> {
        self.shared.ensure_open()?;
        let selector = self.shared.check_selector(selector)?;
        let connection = &self.shared.connection;
        let handle = connection
            .transport
            .subscriber(destination, SubscriberSpec::transient(connection.id))?;
        let consumer = MessageConsumer::open(
            &self.shared,
            ConsumerSettings {
                seq: self.shared.next_consumer.fetch_add(1, Ordering::Relaxed),
                destination: destination.clone(),
                selector,
                no_local,
                subscription: None,
            },
            handle,
        );
        self.shared.adopt(consumer.clone());
        Ok(consumer)
    }

    /// Create a consumer on the durable subscription `name` of `topic`.
    pub fn create_durable_consumer(
        &self,
        topic: &Destination,
        name: &str,
    ) -> Result<MessageConsumer> {
        self.create_durable_consumer_with(topic, name, None, false)
    }

    /// Create a durable consumer with an optional selector and the no-local flag.
    ///
    /// The subscription record is created on first use. Reopening it with a
    /// different topic, selector, or no-local flag fails, as does opening a
    /// name another open consumer holds.
    pub fn create_durable_consumer_with(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<MessageConsumer> {
        self.shared.ensure_open()?;
        let connection = &self.shared.connection;
        let client_id = connection
            .client_id
            .clone()
            .ok_or(BridgeError::MissingClientId)?;
        if !topic.is_topic() {
            return Err(BridgeError::NotATopic(topic.clone()));
        }
        let selector = self.shared.check_selector(selector)?;
        let key = SubscriptionKey::new(client_id, name);

        connection.claim_durable(name)?;
        match self.shared.open_durable(topic, key, selector, no_local) {
            Ok(consumer) => {
                self.shared.adopt(consumer.clone());
                Ok(consumer)
            }
            Err(err) => {
                connection.release_durable(name);
                Err(err)
            }
        }
    }

    /// Delete the durable subscription `name` and its transport-side queue.
    ///
    /// Fails while a consumer holds the name.
    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        self.shared.ensure_open()?;
        let connection = &self.shared.connection;
        let client_id = connection
            .client_id
            .clone()
            .ok_or(BridgeError::MissingClientId)?;
        let key = SubscriptionKey::new(client_id, name);

        let active = connection.durable_names();
        if active.contains(name) {
            return Err(BridgeError::SubscriptionInUse(name.to_owned()));
        }
        let removed_record = connection.store.unsubscribe(&key)?;
        let removed_queue = connection.transport.remove_durable(&key)?;
        drop(active);

        if !removed_record && !removed_queue {
            return Err(BridgeError::UnknownSubscription(name.to_owned()));
        }
        let subscription = key.to_string();
        log_lifecycle_event(
            Some(
                &LogContext::new()
                    .with_session(&self.shared.id)
                    .with_subscription(&subscription),
            ),
            "session.unsubscribe",
            "durable subscription removed",
            LifecycleOutcome::Success,
        );
        Ok(())
    }

    /// Acknowledge every unacknowledged delivery of the session, in delivery
    /// order. Only meaningful in CLIENT mode; a no-op otherwise.
    pub fn acknowledge(&self) -> Result<()> {
        self.shared.acknowledge()
    }

    /// Stop acknowledging pending deliveries and hand them to their consumers
    /// again, marked redelivered.
    pub fn recover(&self) -> Result<()> {
        self.shared.recover()
    }

    /// Number of delivered-but-unacknowledged messages.
    pub fn unacknowledged_count(&self) -> usize {
        self.shared.ledger.len()
    }

    /// Close every child and discard the ledger. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("closed", &self.is_closed())
            .field("unacknowledged", &self.shared.ledger.len())
            .finish()
    }
}

#[derive(Default)]
struct Children {
    consumers: Vec<MessageConsumer>,
    producers: Vec<MessageProducer>,
}

pub(crate) struct SessionShared {
    pub(crate) id: String,
    pub(crate) mode: AcknowledgeMode,
    pub(crate) connection: Arc<ConnectionShared>,
    ledger: Ledger,
    closed: AtomicBool,
    children: Mutex<Children>,
    next_consumer: AtomicU64,
}

impl SessionShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        Ok(())
    }

    fn check_selector(&self, selector: Option<&str>) -> Result<Option<String>> {
        let Some(selector) = selector.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let evaluator = self
            .connection
            .selector
            .as_ref()
            .ok_or(BridgeError::SelectorUnsupported)?;
        evaluator.validate(selector)?;
        Ok(Some(selector.to_owned()))
    }

    fn open_durable(
        self: &Arc<Self>,
        topic: &Destination,
        key: SubscriptionKey,
        selector: Option<String>,
        no_local: bool,
    ) -> Result<MessageConsumer> {
        let connection = &self.connection;
        let requested = SubscriptionInfo::new(topic.clone(), selector.clone(), no_local);
        match connection.store.subscription(&key)? {
            Some(existing) => {
                if let Some(reason) = existing.mismatch(&requested) {
                    return Err(BridgeError::SubscriptionMismatch {
                        name: key.name.clone(),
                        reason,
                    });
                }
            }
            None => {
                connection.store.create(&key, requested)?;
                let subscription = key.to_string();
                bridge_info!(
                    context = LogContext::new()
                        .with_session(&self.id)
                        .with_subscription(&subscription),
                    "created durable subscription on {}",
                    topic
                );
            }
        }
        let handle = connection
            .transport
            .subscriber(topic, SubscriberSpec::durable(connection.id, key.clone()))?;
        Ok(MessageConsumer::open(
            self,
            ConsumerSettings {
                seq: self.next_consumer.fetch_add(1, Ordering::Relaxed),
                destination: topic.clone(),
                selector,
                no_local,
                subscription: Some(key),
            },
            handle,
        ))
    }

    fn adopt(&self, consumer: MessageConsumer) {
        let mut children = self.children.lock();
        children.consumers.retain(|existing| !existing.is_closed());
        children.consumers.push(consumer);
    }

    /// Register a delivery in the ledger and apply the acknowledgement mode.
    ///
    /// In AUTO mode the durable store write completes before this returns.
    /// If that write fails the delivery is not recorded anywhere and the
    /// error is returned; the consumer keeps the sample for a later attempt.
    pub(crate) fn deliver(
        self: &Arc<Self>,
        consumer: ConsumerSeq,
        sample: Sample,
        subscription: Option<SubscriptionKey>,
        message: &mut Message,
    ) -> Result<()> {
        self.ensure_open()?;
        let seq = self.ledger.register(consumer, sample, subscription);
        match self.mode {
            AcknowledgeMode::Auto => {
                if let Some(entry) = self.ledger.remove(seq) {
                    self.persist(&entry)?;
                }
            }
            AcknowledgeMode::Client => {}
            AcknowledgeMode::DupsOk => {
                if self.ledger.len() >= self.connection.dups_ok_batch {
                    if let Err(err) = self.settle(self.ledger.take_all()) {
                        bridge_warn!(
                            context = LogContext::new().with_session(&self.id),
                            "lazy acknowledgement failed: {}",
                            err
                        );
                        self.connection.report(err);
                    }
                }
            }
        }
        message.attach(AckHandle::new(Arc::downgrade(self)));
        Ok(())
    }

    pub(crate) fn acknowledge(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode != AcknowledgeMode::Client {
            return Ok(());
        }
        let pending = self.ledger.take_all();
        if pending.is_empty() {
            return Ok(());
        }
        let count = pending.len();
        self.settle(pending)?;
        bridge_debug!(
            context = LogContext::new().with_session(&self.id),
            "acknowledged {} deliveries",
            count
        );
        Ok(())
    }

    /// Persist entries in order. On failure the unsettled tail goes back to
    /// the ledger and the error is returned.
    fn settle(&self, mut pending: VecDeque<LedgerEntry>) -> Result<()> {
        while let Some(entry) = pending.pop_front() {
            if let Err(err) = self.persist(&entry) {
                pending.push_front(entry);
                self.ledger.restore(pending);
                return Err(err);
            }
        }
        Ok(())
    }

    fn persist(&self, entry: &LedgerEntry) -> Result<()> {
        if let Some(key) = &entry.subscription {
            match self.connection.store.acknowledge(key, entry.message_id()) {
                Ok(()) => {}
                Err(StoreError::UnknownSubscription(_)) => {
                    // Unsubscribed after delivery; nothing left to record.
                    bridge_debug!(
                        context = LogContext::new().with_session(&self.id),
                        "dropping acknowledgement of {} for removed subscription {}",
                        entry.message_id(),
                        key
                    );
                    return Ok(());
                }
                Err(err) => {
                    if let Some(metrics) = &self.connection.metrics {
                        metrics.record_persistence_failure();
                    }
                    return Err(err.into());
                }
            }
        }
        if let Some(metrics) = &self.connection.metrics {
            metrics.record_acknowledged();
        }
        Ok(())
    }

    pub(crate) fn consumer_closed(&self, consumer: ConsumerSeq) {
        if self.mode != AcknowledgeMode::DupsOk {
            return;
        }
        if let Err(err) = self.settle(self.ledger.take_consumer(consumer)) {
            bridge_warn!(
                context = LogContext::new().with_session(&self.id),
                "acknowledgement on consumer close failed: {}",
                err
            );
        }
    }

    fn recover(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode == AcknowledgeMode::Auto {
            return Ok(());
        }
        let pending = self.ledger.take_all();
        if pending.is_empty() {
            return Ok(());
        }
        bridge_info!(
            context = LogContext::new().with_session(&self.id),
            "recovering {} unacknowledged deliveries",
            pending.len()
        );
        let mut by_consumer: BTreeMap<ConsumerSeq, Vec<Sample>> = BTreeMap::new();
        for entry in pending {
            by_consumer
                .entry(entry.consumer)
                .or_default()
                .push(entry.sample.redelivery());
        }
        let consumers = self.children.lock().consumers.clone();
        for (seq, samples) in by_consumer {
            match consumers.iter().find(|consumer| consumer.seq() == seq) {
                Some(consumer) if !consumer.is_closed() => consumer.requeue(samples),
                _ => bridge_debug!(
                    context = LogContext::new().with_session(&self.id),
                    "dropping {} recovered deliveries of closed consumer",
                    samples.len()
                ),
            }
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for consumer in &children.consumers {
            consumer.close();
        }
        for producer in &children.producers {
            producer.close();
        }
        if self.mode == AcknowledgeMode::DupsOk {
            if let Err(err) = self.settle(self.ledger.take_all()) {
                bridge_warn!(
                    context = LogContext::new().with_session(&self.id),
                    "acknowledgement on session close failed: {}",
                    err
                );
            }
        }
        let discarded = self.ledger.clear();
        log_lifecycle_event(
            Some(&LogContext::new().with_session(&self.id)),
            "session.close",
            &format!("session closed, {discarded} unacknowledged deliveries discarded"),
            LifecycleOutcome::Success,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use mqbridge_transport::InMemoryTransport;

    fn connection() -> Connection {
        Connection::builder(Arc::new(InMemoryTransport::new()))
            .client_id("client-a")
            .build()
    }

    #[test]
    fn acknowledge_mode_parses_common_spellings() {
        assert_eq!("auto".parse::<AcknowledgeMode>(), Ok(AcknowledgeMode::Auto));
        assert_eq!("CLIENT".parse::<AcknowledgeMode>(), Ok(AcknowledgeMode::Client));
        assert_eq!("dups_ok".parse::<AcknowledgeMode>(), Ok(AcknowledgeMode::DupsOk));
        assert_eq!("dups-ok".parse::<AcknowledgeMode>(), Ok(AcknowledgeMode::DupsOk));
        assert!("transacted".parse::<AcknowledgeMode>().is_err());
        assert_eq!(AcknowledgeMode::DupsOk.to_string(), "dups-ok");
    }

    #[test]
    fn closed_session_rejects_operations() {
        let connection = connection();
        let session = connection.create_session(AcknowledgeMode::Client).unwrap();
        session.close();
        session.close();

        let topic = Destination::topic("t");
        assert_eq!(
            session.create_consumer(&topic).unwrap_err().to_string(),
            "This Session is closed."
        );
        assert!(matches!(
            session.create_producer(None),
            Err(BridgeError::SessionClosed)
        ));
        assert!(matches!(session.acknowledge(), Err(BridgeError::SessionClosed)));
        assert!(matches!(session.recover(), Err(BridgeError::SessionClosed)));
    }

    #[test]
    fn close_closes_children() {
        let connection = connection();
        let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
        let topic = Destination::topic("t");
        let consumer = session.create_consumer(&topic).unwrap();
        let producer = session.create_producer(Some(&topic)).unwrap();

        session.close();
        assert!(consumer.is_closed());
        assert!(producer.is_closed());
        assert!(matches!(
            consumer.receive_no_wait(),
            Err(BridgeError::ConsumerClosed)
        ));
    }

    #[test]
    fn durable_consumer_requires_client_id_and_topic() {
        let anonymous = Connection::builder(Arc::new(InMemoryTransport::new())).build();
        let session = anonymous.create_session(AcknowledgeMode::Auto).unwrap();
        assert!(matches!(
            session.create_durable_consumer(&Destination::topic("t"), "sub"),
            Err(BridgeError::MissingClientId)
        ));

        let connection = connection();
        let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
        assert!(matches!(
            session.create_durable_consumer(&Destination::queue("q"), "sub"),
            Err(BridgeError::NotATopic(_))
        ));
    }

    #[test]
    fn selector_without_evaluator_is_rejected() {
        let connection = connection();
        let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
        let topic = Destination::topic("t");
        assert!(matches!(
            session.create_consumer_with(&topic, Some("region = 'eu'"), false),
            Err(BridgeError::SelectorUnsupported)
        ));
        // A blank selector means no selector.
        session.create_consumer_with(&topic, Some("  "), false).unwrap();
    }

    #[test]
    fn unsubscribe_unknown_name_fails() {
        let connection = connection();
        let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
        assert!(matches!(
            session.unsubscribe("never-created"),
            Err(BridgeError::UnknownSubscription(_))
        ));
    }
}
