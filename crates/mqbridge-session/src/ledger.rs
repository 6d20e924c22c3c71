//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Per-session bookkeeping of delivered-but-unacknowledged messages.
//!
//! The ledger lock is held only for queue manipulation. Store I/O happens on
//! entries that were taken out of the ledger first.
use std::collections::VecDeque;

use mqbridge_transport::{MessageId, Sample, SubscriptionKey};
use parking_lot::Mutex;

/// Session-local consumer number.
pub(crate) type ConsumerSeq = u64;

#[derive(Debug, Clone)]
pub(crate) struct LedgerEntry {
    pub(crate) seq: u64,
    pub(crate) consumer: ConsumerSeq,
    pub(crate) sample: Sample,
    pub(crate) subscription: Option<SubscriptionKey>,
}

impl LedgerEntry {
    pub(crate) fn message_id(&self) -> &MessageId {
        &self.sample.id
    }
}

#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    queue: VecDeque<LedgerEntry>,
}

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    entries: Mutex<Entries>,
}

impl Ledger {
    /// Record a delivery and return its sequence number.
    pub(crate) fn register(
        &self,
        consumer: ConsumerSeq,
        sample: Sample,
        subscription: Option<SubscriptionKey>,
    ) -> u64 {
        let mut entries = self.entries.lock();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.queue.push_back(LedgerEntry {
            seq,
            consumer,
            sample,
            subscription,
        });
        seq
    }

    pub(crate) fn remove(&self, seq: u64) -> Option<LedgerEntry> {
        let mut entries = self.entries.lock();
        let index = entries.queue.iter().position(|entry| entry.seq == seq)?;
        entries.queue.remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().queue.len()
    }

    /// Remove every entry, in delivery order.
    pub(crate) fn take_all(&self) -> VecDeque<LedgerEntry> {
        std::mem::take(&mut self.entries.lock().queue)
    }

    /// Remove the entries of one consumer, in delivery order.
    pub(crate) fn take_consumer(&self, consumer: ConsumerSeq) -> VecDeque<LedgerEntry> {
        let mut entries = self.entries.lock();
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut entries.queue)
            .into_iter()
            .partition(|entry| entry.consumer == consumer);
        entries.queue = kept;
        taken
    }

    /// Put entries that could not be settled back ahead of newer deliveries.
    pub(crate) fn restore(&self, pending: VecDeque<LedgerEntry>) {
        if pending.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        let newer = std::mem::replace(&mut entries.queue, pending);
        entries.queue.extend(newer);
        entries.queue.make_contiguous().sort_by_key(|entry| entry.seq);
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.queue.len();
        entries.queue.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mqbridge_transport::{ConnectionId, DeliveryMode, Destination, OutboundSample};

    fn sample(body: &'static str) -> Sample {
        Sample::from_outbound(
            Destination::queue("work"),
            OutboundSample {
                payload: Bytes::from_static(body.as_bytes()),
                delivery_mode: DeliveryMode::Persistent,
                priority: 4,
                time_to_live: 0,
                origin: ConnectionId::generate(),
            },
        )
    }

    fn payloads(entries: &VecDeque<LedgerEntry>) -> Vec<Bytes> {
        entries.iter().map(|entry| entry.sample.payload.clone()).collect()
    }

    #[test]
    fn register_and_remove_by_sequence() {
        let ledger = Ledger::default();
        let first = ledger.register(1, sample("a"), None);
        let second = ledger.register(1, sample("b"), None);
        assert_eq!(ledger.len(), 2);

        let removed = ledger.remove(first).unwrap();
        assert_eq!(removed.sample.payload, Bytes::from_static(b"a"));
        assert!(ledger.remove(first).is_none());
        assert_eq!(ledger.len(), 1);
        assert!(ledger.remove(second).is_some());
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn take_consumer_keeps_other_consumers_in_order() {
        let ledger = Ledger::default();
        ledger.register(1, sample("a1"), None);
        ledger.register(2, sample("b1"), None);
        ledger.register(1, sample("a2"), None);
        ledger.register(2, sample("b2"), None);

        let taken = ledger.take_consumer(1);
        assert_eq!(payloads(&taken), vec![Bytes::from("a1"), Bytes::from("a2")]);
        let rest = ledger.take_all();
        assert_eq!(payloads(&rest), vec![Bytes::from("b1"), Bytes::from("b2")]);
    }

    #[test]
    fn restore_puts_older_entries_first() {
        let ledger = Ledger::default();
        ledger.register(1, sample("m1"), None);
        ledger.register(1, sample("m2"), None);
        let mut pending = ledger.take_all();
        pending.pop_front();

        ledger.register(1, sample("m3"), None);
        ledger.restore(pending);
        assert_eq!(
            payloads(&ledger.take_all()),
            vec![Bytes::from("m2"), Bytes::from("m3")]
        );
    }

    #[test]
    fn clear_reports_dropped_entries() {
        let ledger = Ledger::default();
        ledger.register(1, sample("a"), None);
        ledger.register(1, sample("b"), None);
        assert_eq!(ledger.clear(), 2);
        assert_eq!(ledger.len(), 0);
    }
}
