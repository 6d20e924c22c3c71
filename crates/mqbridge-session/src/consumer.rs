//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Consumers: synchronous receive, listener dispatch, and the per-message
//! delivery pipeline.
//!
//! The transport pushes every sample into the consumer's mailbox through a
//! callback. Without a listener `receive*` picks samples up from there. With
//! one, whichever thread finds the mailbox idle becomes its dispatcher and
//! runs the pipeline and the listener until the mailbox is empty; samples
//! arriving meanwhile, including ones the listener itself publishes, are
//! queued behind it. No lock is held while the listener runs. `close()` wakes
//! blocked receivers through the mailbox condition variable.
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use mqbridge_logging::{
    bridge_debug, bridge_error, log_lifecycle_event, LifecycleOutcome, LogContext,
};
use mqbridge_transport::{Destination, Sample, SampleCallback, SubscribeHandle, SubscriptionKey};
use parking_lot::{Condvar, Mutex};

use crate::connection::ConnectionShared;
use crate::ledger::ConsumerSeq;
use crate::message::Message;
use crate::session::SessionShared;
use crate::{BridgeError, Result};

/// Asynchronous delivery callback. Invoked sequentially per consumer.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

pub(crate) struct ConsumerSettings {
    pub(crate) seq: ConsumerSeq,
    pub(crate) destination: Destination,
    pub(crate) selector: Option<String>,
    pub(crate) no_local: bool,
    pub(crate) subscription: Option<SubscriptionKey>,
}

/// Receives messages from a destination on behalf of a session.
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    settings: ConsumerSettings,
    label: String,
    session_id: String,
    session: Weak<SessionShared>,
    connection: Arc<ConnectionShared>,
    handle: Arc<dyn SubscribeHandle>,
    closed: AtomicBool,
    mailbox: Mutex<Mailbox>,
    arrived: Condvar,
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Sample>,
    listener: Option<MessageListener>,
    // Set while one thread is handing queued samples to the listener.
    dispatching: bool,
    closed: bool,
}

enum Wait {
    Never,
    Forever,
    Until(Instant),
}

impl MessageConsumer {
    pub(crate) fn open(
        session: &Arc<SessionShared>,
        settings: ConsumerSettings,
        handle: Arc<dyn SubscribeHandle>,
    ) -> Self {
        let label = format!("consumer-{}", settings.seq);
        let inner = Arc::new(ConsumerInner {
            label,
            session_id: session.id.clone(),
            session: Arc::downgrade(session),
            connection: Arc::clone(&session.connection),
            handle,
            closed: AtomicBool::new(false),
            mailbox: Mutex::new(Mailbox::default()),
            arrived: Condvar::new(),
            settings,
        });

        let weak = Arc::downgrade(&inner);
        let pump: SampleCallback = Arc::new(move |sample: Sample| {
            if let Some(inner) = weak.upgrade() {
                inner.on_sample(sample);
            }
        });
        inner.handle.on_message(Some(pump));

        let destination = inner.settings.destination.to_string();
        let subscription = inner.settings.subscription.as_ref().map(ToString::to_string);
        let mut context = LogContext::new()
            .with_session(&inner.session_id)
            .with_consumer(&inner.label)
            .with_destination(&destination);
        if let Some(subscription) = &subscription {
            context = context.with_subscription(subscription);
        }
        log_lifecycle_event(
            Some(&context),
            "consumer.open",
            "consumer attached",
            LifecycleOutcome::Success,
        );
        Self { inner }
    }

    pub(crate) fn seq(&self) -> ConsumerSeq {
        self.inner.settings.seq
    }

    /// Destination the consumer reads from.
    pub fn destination(&self) -> &Destination {
        &self.inner.settings.destination
    }

    /// Selector supplied at creation.
    pub fn message_selector(&self) -> Option<&str> {
        self.inner.settings.selector.as_deref()
    }

    /// Whether messages published through the same connection are suppressed.
    pub fn no_local(&self) -> bool {
        self.inner.settings.no_local
    }

    /// Durable subscription name, for durable consumers.
    pub fn subscription_name(&self) -> Option<&str> {
        self.inner
            .settings
            .subscription
            .as_ref()
            .map(|key| key.name.as_str())
    }

    /// Whether [`MessageConsumer::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Block until a message arrives or the consumer is closed.
    ///
    /// Returns `Ok(None)` when another thread closes the consumer during the wait.
    pub fn receive(&self) -> Result<Option<Message>> {
        self.inner.receive(Wait::Forever)
    }

    /// Block for at most `timeout`. Returns `Ok(None)` on timeout or close.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        self.inner.receive(Wait::Until(Instant::now() + timeout))
    }

    /// Return a message only if one is immediately available.
    pub fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.inner.receive(Wait::Never)
    }

    /// Install or clear the asynchronous listener.
    ///
    /// Messages already waiting in the consumer are handed to a newly
    /// installed listener first, in arrival order.
    pub fn set_message_listener(&self, listener: Option<MessageListener>) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.mailbox.lock().listener = listener;
        self.inner.dispatch();
        Ok(())
    }

    /// Currently installed listener.
    pub fn message_listener(&self) -> Result<Option<MessageListener>> {
        self.inner.ensure_open()?;
        Ok(self.inner.mailbox.lock().listener.clone())
    }

    /// Hand recovered deliveries back to the application, ahead of newer ones.
    pub(crate) fn requeue(&self, samples: Vec<Sample>) {
        self.inner.push_front(samples);
        self.inner.dispatch();
    }

    /// Close the consumer. Safe to call from any thread, including while
    /// another thread is blocked in `receive`. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Stop the pump first so nothing lands in the mailbox after it is drained.
        inner.handle.on_message(None);
        let unconsumed = {
            let mut mailbox = inner.mailbox.lock();
            mailbox.closed = true;
            mailbox.listener = None;
            std::mem::take(&mut mailbox.queue)
        };
        inner.arrived.notify_all();
        inner.handle.close_returning(unconsumed.into());

        if let Some(key) = &inner.settings.subscription {
            inner.connection.release_durable(&key.name);
        }
        if let Some(session) = inner.session.upgrade() {
            session.consumer_closed(inner.settings.seq);
        }

        let destination = inner.settings.destination.to_string();
        log_lifecycle_event(
            Some(
                &LogContext::new()
                    .with_session(&inner.session_id)
                    .with_consumer(&inner.label)
                    .with_destination(&destination),
            ),
            "consumer.close",
            "consumer closed",
            LifecycleOutcome::Success,
        );
    }
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("session", &self.inner.session_id)
            .field("consumer", &self.inner.label)
            .field("destination", &self.inner.settings.destination)
            .field("durable", &self.subscription_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConsumerInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ConsumerClosed);
        }
        Ok(())
    }

    fn on_sample(&self, sample: Sample) {
        {
            let mut mailbox = self.mailbox.lock();
            if mailbox.closed {
                return;
            }
            mailbox.queue.push_back(sample);
            self.arrived.notify_one();
        }
        self.dispatch();
    }

    fn push_front(&self, samples: Vec<Sample>) {
        let mut mailbox = self.mailbox.lock();
        if mailbox.closed {
            return;
        }
        for sample in samples.into_iter().rev() {
            mailbox.queue.push_front(sample);
        }
        self.arrived.notify_all();
    }

    /// Hand queued samples to the listener, one at a time, until the mailbox
    /// is empty, the listener is cleared, or a delivery has to be retried.
    ///
    /// Returns at once when no listener is set or another call is already
    /// dispatching; that call picks up whatever was queued.
    fn dispatch(&self) {
        {
            let mut mailbox = self.mailbox.lock();
            if mailbox.dispatching || mailbox.closed || mailbox.listener.is_none() {
                return;
            }
            mailbox.dispatching = true;
        }
        loop {
            let next = {
                let mut guard = self.mailbox.lock();
                let mailbox = &mut *guard;
                let next = match &mailbox.listener {
                    Some(listener) if !mailbox.closed => mailbox
                        .queue
                        .pop_front()
                        .map(|sample| (Arc::clone(listener), sample)),
                    _ => None,
                };
                if next.is_none() {
                    mailbox.dispatching = false;
                }
                next
            };
            let Some((listener, sample)) = next else {
                return;
            };
            if !self.dispatch_one(&listener, sample) {
                self.mailbox.lock().dispatching = false;
                return;
            }
        }
    }

    /// Returns `false` when the sample went back to the mailbox and
    /// dispatching should pause until the next arrival.
    fn dispatch_one(&self, listener: &MessageListener, sample: Sample) -> bool {
        match self.process(sample) {
            Ok(Some(message)) => {
                listener(message);
                true
            }
            Ok(None) => true,
            Err(err) => {
                let retry = matches!(err, BridgeError::Persistence(_));
                let destination = self.settings.destination.to_string();
                bridge_error!(
                    context = LogContext::new()
                        .with_session(&self.session_id)
                        .with_consumer(&self.label)
                        .with_destination(&destination),
                    "asynchronous delivery failed: {}",
                    err
                );
                self.connection.report(err);
                !(retry && self.settings.subscription.is_some())
            }
        }
    }

    fn receive(&self, wait: Wait) -> Result<Option<Message>> {
        self.ensure_open()?;
        if self.mailbox.lock().listener.is_some() {
            return Err(BridgeError::ListenerActive);
        }
        let started = Instant::now();
        loop {
            let Some(sample) = self.next_sample(&wait) else {
                return Ok(None);
            };
            // Filtered samples are not counted as received; keep waiting.
            if let Some(message) = self.process(sample)? {
                if let Some(metrics) = &self.connection.metrics {
                    metrics.observe_receive_wait(started.elapsed());
                }
                return Ok(Some(message));
            }
        }
    }

    fn next_sample(&self, wait: &Wait) -> Option<Sample> {
        let mut mailbox = self.mailbox.lock();
        loop {
            if mailbox.closed {
                return None;
            }
            if let Some(sample) = mailbox.queue.pop_front() {
                return Some(sample);
            }
            match wait {
                Wait::Never => return None,
                Wait::Forever => self.arrived.wait(&mut mailbox),
                Wait::Until(deadline) => {
                    if self.arrived.wait_until(&mut mailbox, *deadline).timed_out() {
                        if mailbox.closed {
                            return None;
                        }
                        return mailbox.queue.pop_front();
                    }
                }
            }
        }
    }

    /// Run one sample through expiry, no-local, duplicate, and selector
    /// filtering, then register it with the session.
    ///
    /// `Ok(None)` means the sample was filtered out. When a durable consumer
    /// cannot reach its subscription store the sample goes back to the front
    /// of the mailbox before the error is returned.
    fn process(&self, sample: Sample) -> Result<Option<Message>> {
        let retained = self.settings.subscription.as_ref().map(|_| sample.clone());
        match self.run_pipeline(sample) {
            Err(err @ BridgeError::Persistence(_)) => {
                if let Some(sample) = retained {
                    self.push_front(vec![sample]);
                }
                Err(err)
            }
            outcome => outcome,
        }
    }

    fn run_pipeline(&self, sample: Sample) -> Result<Option<Message>> {
        let context_destination = self.settings.destination.to_string();
        let context = LogContext::new()
            .with_session(&self.session_id)
            .with_consumer(&self.label)
            .with_destination(&context_destination);

        if sample.is_expired(Utc::now()) {
            bridge_debug!(context = context, "discarding expired message {}", sample.id);
            return Ok(None);
        }
        if self.settings.no_local && sample.origin == self.connection.id {
            return Ok(None);
        }
        if let Some(key) = &self.settings.subscription {
            let acknowledged = self
                .connection
                .store
                .is_acknowledged(key, &sample.id)
                .inspect_err(|_| {
                    if let Some(metrics) = &self.connection.metrics {
                        metrics.record_persistence_failure();
                    }
                })?;
            if acknowledged {
                if let Some(metrics) = &self.connection.metrics {
                    metrics.record_duplicate();
                }
                bridge_debug!(
                    context = context,
                    "suppressing already acknowledged message {}",
                    sample.id
                );
                return Ok(None);
            }
        }

        let mut message = Message::from_sample(&sample)?;
        if let Some(selector) = &self.settings.selector {
            let evaluator = self
                .connection
                .selector
                .as_ref()
                .ok_or(BridgeError::SelectorUnsupported)?;
            if !evaluator.matches(&message, selector)? {
                return Ok(None);
            }
        }

        let session = self.session.upgrade().ok_or(BridgeError::SessionClosed)?;
        SessionShared::deliver(
            &session,
            self.settings.seq,
            sample,
            self.settings.subscription.clone(),
            &mut message,
        )?;
        if let Some(metrics) = &self.connection.metrics {
            metrics.record_received(&context_destination);
        }
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::session::AcknowledgeMode;
    use mqbridge_transport::{InMemoryTransport, TransportBinding};
    use std::thread;

    fn session(mode: AcknowledgeMode) -> (Connection, crate::Session) {
        let transport: Arc<dyn TransportBinding> = Arc::new(InMemoryTransport::new());
        let connection = Connection::builder(transport).client_id("client-a").build();
        let session = connection.create_session(mode).unwrap();
        (connection, session)
    }

    #[test]
    fn receive_after_close_fails() {
        let (_connection, session) = session(AcknowledgeMode::Auto);
        let consumer = session.create_consumer(&Destination::queue("q")).unwrap();
        consumer.close();
        consumer.close();
        assert_eq!(
            consumer.receive_no_wait().unwrap_err().to_string(),
            "This MessageConsumer is closed."
        );
        assert!(matches!(
            consumer.message_listener(),
            Err(BridgeError::ConsumerClosed)
        ));
    }

    #[test]
    fn timeout_elapses_without_messages() {
        let (_connection, session) = session(AcknowledgeMode::Auto);
        let consumer = session.create_consumer(&Destination::queue("q")).unwrap();
        let started = Instant::now();
        assert!(consumer
            .receive_timeout(Duration::from_millis(50))
            .unwrap()
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(consumer.receive_no_wait().unwrap().is_none());
    }

    #[test]
    fn close_wakes_timed_receive() {
        let (_connection, session) = session(AcknowledgeMode::Auto);
        let consumer = session.create_consumer(&Destination::queue("q")).unwrap();
        let closer = consumer.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        let started = Instant::now();
        assert!(consumer
            .receive_timeout(Duration::from_secs(30))
            .unwrap()
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(30));
        handle.join().unwrap();
    }

    #[test]
    fn receive_while_listener_is_set_fails() {
        let (_connection, session) = session(AcknowledgeMode::Auto);
        let consumer = session.create_consumer(&Destination::topic("t")).unwrap();
        consumer
            .set_message_listener(Some(Arc::new(|_message: Message| {})))
            .unwrap();
        assert_eq!(
            consumer.receive_no_wait().unwrap_err().to_string(),
            "A MessageListener is set on this MessageConsumer."
        );
        consumer.set_message_listener(None).unwrap();
        assert!(consumer.receive_no_wait().unwrap().is_none());
    }

    #[test]
    fn expired_messages_are_discarded() {
        let (_connection, session) = session(AcknowledgeMode::Client);
        let queue = Destination::queue("q");
        let consumer = session.create_consumer(&queue).unwrap();
        let producer = session.create_producer(Some(&queue)).unwrap();
        producer
            .send_with(&Message::text("stale"), mqbridge_transport::DeliveryMode::Persistent, 4, 1)
            .unwrap();
        producer.send(&Message::text("fresh")).unwrap();
        thread::sleep(Duration::from_millis(20));

        let message = consumer.receive_no_wait().unwrap().unwrap();
        assert_eq!(message.text_body(), Some("fresh"));
        assert!(consumer.receive_no_wait().unwrap().is_none());
        assert_eq!(session.unacknowledged_count(), 1);
    }
}
