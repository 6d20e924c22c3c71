//! ---
//! mqb_section: "02-transport-boundary"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Transport handles, samples, and provider registry."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::transport::{
    PublishHandle, SampleCallback, SubscribeHandle, SubscriberSpec, TransportBinding,
};
use crate::types::{Destination, MessageId, OutboundSample, Sample, SubscriptionKey};
use crate::{Result, TransportError};

/// Default number of samples a topic retains for replay into new durable queues.
pub const DEFAULT_HISTORY_DEPTH: usize = 0;

/// In-process topic/queue transport.
///
/// Delivery happens on the publishing thread. Topics fan out to every
/// attached reader and to every durable queue; queues hand each sample to a
/// single open reader, round robin, and keep a backlog while none is attached.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    history_depth: usize,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicState>,
    queues: HashMap<String, QueueState>,
    durable: HashMap<SubscriptionKey, Arc<ReaderQueue>>,
}

#[derive(Default)]
struct TopicState {
    readers: Vec<Arc<ReaderQueue>>,
    history: VecDeque<Sample>,
}

#[derive(Default)]
struct QueueState {
    readers: Vec<Arc<ReaderQueue>>,
    backlog: VecDeque<Sample>,
    next: usize,
}

struct ReaderQueue {
    destination: Destination,
    state: Mutex<ReaderState>,
    // Serializes deliveries so a reader observes samples in publish order.
    delivery: ReentrantMutex<()>,
}

#[derive(Default)]
struct ReaderState {
    buffer: VecDeque<Sample>,
    callback: Option<SampleCallback>,
    closed: bool,
}

impl ReaderQueue {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            state: Mutex::new(ReaderState::default()),
            delivery: ReentrantMutex::new(()),
        }
    }

    fn deliver(&self, sample: Sample) {
        let _ordered = self.delivery.lock();
        let callback = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match state.callback.clone() {
                Some(callback) => callback,
                None => {
                    state.buffer.push_back(sample);
                    return;
                }
            }
        };
        callback(sample);
    }

    fn attach(&self, callback: Option<SampleCallback>) {
        let _ordered = self.delivery.lock();
        let pending = {
            let mut state = self.state.lock();
            state.callback = callback.clone();
            if callback.is_some() {
                std::mem::take(&mut state.buffer)
            } else {
                VecDeque::new()
            }
        };
        if let Some(callback) = callback {
            for sample in pending {
                callback(sample);
            }
        }
    }

    fn buffer(&self, samples: impl IntoIterator<Item = Sample>) {
        self.state.lock().buffer.extend(samples);
    }

    fn buffer_front(&self, samples: Vec<Sample>) {
        let mut state = self.state.lock();
        for sample in samples.into_iter().rev() {
            state.buffer.push_front(sample);
        }
    }

    fn take_next(&self) -> Option<Sample> {
        self.state.lock().buffer.pop_front()
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closed
    }

    fn detach(&self) {
        self.state.lock().callback = None;
    }

    fn shut(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.callback = None;
        state.buffer.clear();
    }
}

impl Inner {
    fn route(&self, sample: Sample, record_history: bool) {
        let targets = {
            let mut state = self.state.lock();
            match &sample.destination {
                Destination::Topic(name) => {
                    let topic = state.topics.entry(name.clone()).or_default();
                    if record_history && self.history_depth > 0 {
                        topic.history.push_back(sample.clone());
                        while topic.history.len() > self.history_depth {
                            topic.history.pop_front();
                        }
                    }
                    topic.readers.clone()
                }
                Destination::Queue(name) => {
                    let queue = state.queues.entry(name.clone()).or_default();
                    queue.readers.retain(|reader| reader.is_open());
                    if queue.readers.is_empty() {
                        trace!(destination = %sample.destination, id = %sample.id, "queue backlog");
                        queue.backlog.push_back(sample);
                        return;
                    }
                    let index = queue.next % queue.readers.len();
                    queue.next = queue.next.wrapping_add(1);
                    vec![Arc::clone(&queue.readers[index])]
                }
            }
        };

        for reader in targets {
            reader.deliver(sample.clone());
        }
    }

    fn remove_reader(&self, reader: &Arc<ReaderQueue>) {
        let mut state = self.state.lock();
        let readers = match &reader.destination {
            Destination::Topic(name) => state.topics.get_mut(name).map(|t| &mut t.readers),
            Destination::Queue(name) => state.queues.get_mut(name).map(|q| &mut q.readers),
        };
        if let Some(readers) = readers {
            readers.retain(|candidate| !Arc::ptr_eq(candidate, reader));
        }
    }
}

impl InMemoryTransport {
    /// Create a transport without topic history.
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY_DEPTH)
    }

    /// Create a transport whose topics retain the last `depth` samples.
    pub fn with_history(depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                history_depth: depth,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Deliver an already published sample again, as an at-least-once transport may.
    pub fn inject(&self, sample: Sample) {
        debug!(destination = %sample.destination, id = %sample.id, "redelivering sample");
        self.inner.route(sample.redelivery(), false);
    }

    /// Number of readers (including detached durable queues) on a destination.
    pub fn reader_count(&self, destination: &Destination) -> usize {
        let state = self.inner.state.lock();
        match destination {
            Destination::Topic(name) => state.topics.get(name).map_or(0, |t| t.readers.len()),
            Destination::Queue(name) => state.queues.get(name).map_or(0, |q| q.readers.len()),
        }
    }

    /// Whether a durable transport-side queue exists for `key`.
    pub fn has_durable(&self, key: &SubscriptionKey) -> bool {
        self.inner.state.lock().durable.contains_key(key)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBinding for InMemoryTransport {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn publisher(&self, destination: &Destination) -> Result<Arc<dyn PublishHandle>> {
        Ok(Arc::new(MemoryPublisher {
            destination: destination.clone(),
            transport: Arc::downgrade(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    fn subscriber(
        &self,
        destination: &Destination,
        spec: SubscriberSpec,
    ) -> Result<Arc<dyn SubscribeHandle>> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let (queue, durable) = match (&spec.durable, destination) {
            (Some(_), Destination::Queue(_)) => {
                return Err(TransportError::DurableRequiresTopic(destination.clone()));
            }
            (Some(key), Destination::Topic(name)) => match state.durable.get(key).cloned() {
                Some(existing) => (existing, true),
                None => {
                    let queue = Arc::new(ReaderQueue::new(destination.clone()));
                    let topic = state.topics.entry(name.clone()).or_default();
                    queue.buffer(topic.history.iter().cloned());
                    topic.readers.push(Arc::clone(&queue));
                    state.durable.insert(key.clone(), Arc::clone(&queue));
                    debug!(subscription = %key, destination = %destination, "durable queue created");
                    (queue, true)
                }
            },
            (None, Destination::Topic(name)) => {
                let queue = Arc::new(ReaderQueue::new(destination.clone()));
                state
                    .topics
                    .entry(name.clone())
                    .or_default()
                    .readers
                    .push(Arc::clone(&queue));
                (queue, false)
            }
            (None, Destination::Queue(name)) => {
                let queue = Arc::new(ReaderQueue::new(destination.clone()));
                let entry = state.queues.entry(name.clone()).or_default();
                queue.buffer(entry.backlog.drain(..));
                entry.readers.push(Arc::clone(&queue));
                (queue, false)
            }
        };
        drop(guard);

        Ok(Arc::new(MemorySubscriber {
            queue,
            durable,
            transport: Arc::downgrade(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    fn remove_durable(&self, key: &SubscriptionKey) -> Result<bool> {
        let Some(queue) = self.inner.state.lock().durable.remove(key) else {
            return Ok(false);
        };
        self.inner.remove_reader(&queue);
        queue.shut();
        debug!(subscription = %key, "durable queue removed");
        Ok(true)
    }
}

struct MemoryPublisher {
    destination: Destination,
    transport: Weak<Inner>,
    closed: AtomicBool,
}

impl PublishHandle for MemoryPublisher {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn send(&self, outbound: OutboundSample) -> Result<MessageId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::PublisherClosed(self.destination.clone()));
        }
        let inner = self
            .transport
            .upgrade()
            .ok_or_else(|| TransportError::Unavailable("in-memory transport dropped".into()))?;
        let sample = Sample::from_outbound(self.destination.clone(), outbound);
        let id = sample.id.clone();
        inner.route(sample, true);
        Ok(id)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct MemorySubscriber {
    queue: Arc<ReaderQueue>,
    durable: bool,
    transport: Weak<Inner>,
    closed: AtomicBool,
}

impl SubscribeHandle for MemorySubscriber {
    fn destination(&self) -> &Destination {
        &self.queue.destination
    }

    fn on_message(&self, callback: Option<SampleCallback>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.queue.attach(callback);
    }

    fn take_next(&self) -> Option<Sample> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.queue.take_next()
    }

    fn close_returning(&self, unconsumed: Vec<Sample>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.durable {
            // The queue outlives the reader and keeps buffering.
            self.queue.detach();
            self.queue.buffer_front(unconsumed);
            return;
        }
        self.queue.shut();
        if let Some(inner) = self.transport.upgrade() {
            inner.remove_reader(&self.queue);
            if !self.queue.destination.is_topic() {
                for sample in unconsumed {
                    inner.route(sample, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, ConnectionId, DeliveryMode};
    use bytes::Bytes;

    fn outbound(body: &'static str) -> OutboundSample {
        OutboundSample {
            payload: Bytes::from_static(body.as_bytes()),
            delivery_mode: DeliveryMode::Persistent,
            priority: 4,
            time_to_live: 0,
            origin: ConnectionId::generate(),
        }
    }

    fn drain(handle: &Arc<dyn SubscribeHandle>) -> Vec<Bytes> {
        std::iter::from_fn(|| handle.take_next())
            .map(|sample| sample.payload)
            .collect()
    }

    #[test]
    fn topic_fans_out_to_every_reader() {
        let transport = InMemoryTransport::new();
        let topic = Destination::topic("prices");
        let a = transport
            .subscriber(&topic, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();
        let b = transport
            .subscriber(&topic, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();

        let publisher = transport.publisher(&topic).unwrap();
        publisher.send(outbound("m1")).unwrap();
        publisher.send(outbound("m2")).unwrap();

        assert_eq!(drain(&a), vec!["m1", "m2"]);
        assert_eq!(drain(&b), vec!["m1", "m2"]);
    }

    #[test]
    fn queue_round_robins_and_keeps_backlog() {
        let transport = InMemoryTransport::new();
        let queue = Destination::queue("orders");
        let publisher = transport.publisher(&queue).unwrap();
        publisher.send(outbound("early")).unwrap();

        let a = transport
            .subscriber(&queue, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();
        let b = transport
            .subscriber(&queue, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();
        publisher.send(outbound("m1")).unwrap();
        publisher.send(outbound("m2")).unwrap();

        assert_eq!(drain(&a), vec!["early", "m1"]);
        assert_eq!(drain(&b), vec!["m2"]);
    }

    #[test]
    fn installing_callback_flushes_buffer_in_order() {
        let transport = InMemoryTransport::new();
        let topic = Destination::topic("t");
        let handle = transport
            .subscriber(&topic, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();
        let publisher = transport.publisher(&topic).unwrap();
        publisher.send(outbound("m1")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handle.on_message(Some(Arc::new(move |sample: Sample| {
            sink.lock().push(sample.payload);
        })));
        publisher.send(outbound("m2")).unwrap();

        assert_eq!(*seen.lock(), vec!["m1", "m2"]);
        assert!(handle.take_next().is_none());
    }

    #[test]
    fn durable_queue_buffers_while_detached() {
        let transport = InMemoryTransport::new();
        let topic = Destination::topic("news");
        let key = SubscriptionKey::new(ClientId::new("client-a"), "sub");
        let connection = ConnectionId::generate();

        let first = transport
            .subscriber(&topic, SubscriberSpec::durable(connection, key.clone()))
            .unwrap();
        first.close();

        transport.publisher(&topic).unwrap().send(outbound("offline")).unwrap();

        let second = transport
            .subscriber(&topic, SubscriberSpec::durable(connection, key.clone()))
            .unwrap();
        assert_eq!(drain(&second), vec!["offline"]);

        assert!(transport.remove_durable(&key).unwrap());
        assert!(!transport.has_durable(&key));
        assert!(!transport.remove_durable(&key).unwrap());
    }

    #[test]
    fn durable_queue_rejects_queue_destination() {
        let transport = InMemoryTransport::new();
        let key = SubscriptionKey::new(ClientId::new("client-a"), "sub");
        let result = transport.subscriber(
            &Destination::queue("q"),
            SubscriberSpec::durable(ConnectionId::generate(), key),
        );
        assert!(matches!(result, Err(TransportError::DurableRequiresTopic(_))));
    }

    #[test]
    fn history_replays_into_new_durable_queue() {
        let transport = InMemoryTransport::with_history(2);
        let topic = Destination::topic("t");
        let publisher = transport.publisher(&topic).unwrap();
        for body in ["m1", "m2", "m3"] {
            publisher.send(outbound(body)).unwrap();
        }

        let key = SubscriptionKey::new(ClientId::new("c"), "late");
        let handle = transport
            .subscriber(&topic, SubscriberSpec::durable(ConnectionId::generate(), key))
            .unwrap();
        assert_eq!(drain(&handle), vec!["m2", "m3"]);
    }

    #[test]
    fn inject_redelivers_with_same_id() {
        let transport = InMemoryTransport::new();
        let topic = Destination::topic("t");
        let handle = transport
            .subscriber(&topic, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();
        transport.publisher(&topic).unwrap().send(outbound("m1")).unwrap();
        let first = handle.take_next().unwrap();

        transport.inject(first.clone());
        let again = handle.take_next().unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.redelivered());
    }

    #[test]
    fn unconsumed_samples_return_to_durable_and_queue_readers() {
        let transport = InMemoryTransport::new();
        let topic = Destination::topic("news");
        let key = SubscriptionKey::new(ClientId::new("client-a"), "sub");
        let connection = ConnectionId::generate();
        let publisher = transport.publisher(&topic).unwrap();

        let durable = transport
            .subscriber(&topic, SubscriberSpec::durable(connection, key.clone()))
            .unwrap();
        publisher.send(outbound("m1")).unwrap();
        publisher.send(outbound("m2")).unwrap();
        let prefetched = vec![durable.take_next().unwrap()];
        durable.close_returning(prefetched);
        publisher.send(outbound("m3")).unwrap();

        let resumed = transport
            .subscriber(&topic, SubscriberSpec::durable(connection, key))
            .unwrap();
        assert_eq!(drain(&resumed), vec!["m1", "m2", "m3"]);

        let queue = Destination::queue("jobs");
        let first = transport
            .subscriber(&queue, SubscriberSpec::transient(connection))
            .unwrap();
        transport.publisher(&queue).unwrap().send(outbound("job")).unwrap();
        let taken = first.take_next().unwrap();
        first.close_returning(vec![taken]);

        let second = transport
            .subscriber(&queue, SubscriberSpec::transient(connection))
            .unwrap();
        assert_eq!(drain(&second), vec!["job"]);
    }

    #[test]
    fn closed_publisher_and_reader() {
        let transport = InMemoryTransport::new();
        let topic = Destination::topic("t");
        let handle = transport
            .subscriber(&topic, SubscriberSpec::transient(ConnectionId::generate()))
            .unwrap();
        assert_eq!(transport.reader_count(&topic), 1);
        handle.close();
        handle.close();
        assert_eq!(transport.reader_count(&topic), 0);

        let publisher = transport.publisher(&topic).unwrap();
        publisher.close();
        assert!(matches!(
            publisher.send(outbound("m1")),
            Err(TransportError::PublisherClosed(_))
        ));
    }
}
