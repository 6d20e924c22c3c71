//! ---
//! mqb_section: "03-durable-subscriptions"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Durable subscription records and acknowledgement persistence."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use indexmap::IndexSet;
use mqbridge_transport::{MessageId, SubscriptionKey};
use parking_lot::Mutex;

use crate::store::{SubscriptionInfo, SubscriptionStore, SubscriptionSummary};
use crate::{Result, StoreError};

/// Process-local store. Records vanish with the process.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    records: Mutex<BTreeMap<SubscriptionKey, Record>>,
}

#[derive(Debug)]
struct Record {
    info: SubscriptionInfo,
    acknowledged: IndexSet<MessageId>,
}

impl InMemorySubscriptionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for InMemorySubscriptionStore {
    fn subscription(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionInfo>> {
        Ok(self.records.lock().get(key).map(|record| record.info.clone()))
    }

    fn create(&self, key: &SubscriptionKey, info: SubscriptionInfo) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        records.insert(
            key.clone(),
            Record {
                info,
                acknowledged: IndexSet::new(),
            },
        );
        Ok(())
    }

    fn is_acknowledged(&self, key: &SubscriptionKey, id: &MessageId) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .get(key)
            .is_some_and(|record| record.acknowledged.contains(id)))
    }

    fn acknowledge(&self, key: &SubscriptionKey, id: &MessageId) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownSubscription(key.clone()))?;
        record.acknowledged.insert(id.clone());
        Ok(())
    }

    fn unsubscribe(&self, key: &SubscriptionKey) -> Result<bool> {
        Ok(self.records.lock().remove(key).is_some())
    }

    fn acknowledged_ids(&self, key: &SubscriptionKey) -> Result<Vec<MessageId>> {
        let records = self.records.lock();
        let record = records
            .get(key)
            .ok_or_else(|| StoreError::UnknownSubscription(key.clone()))?;
        Ok(record.acknowledged.iter().cloned().collect())
    }

    fn subscriptions(&self) -> Result<Vec<SubscriptionSummary>> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(key, record)| SubscriptionSummary {
                key: key.clone(),
                info: record.info.clone(),
                acknowledged: record.acknowledged.len(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqbridge_transport::{ClientId, Destination};

    fn key(name: &str) -> SubscriptionKey {
        SubscriptionKey::new(ClientId::new("client-a"), name)
    }

    fn info() -> SubscriptionInfo {
        SubscriptionInfo::new(Destination::topic("news"), None, false)
    }

    #[test]
    fn acknowledge_requires_record() {
        let store = InMemorySubscriptionStore::new();
        let id = MessageId::from("X");
        assert!(matches!(
            store.acknowledge(&key("s"), &id),
            Err(StoreError::UnknownSubscription(_))
        ));

        store.create(&key("s"), info()).unwrap();
        store.acknowledge(&key("s"), &id).unwrap();
        store.acknowledge(&key("s"), &id).unwrap();
        assert!(store.is_acknowledged(&key("s"), &id).unwrap());
        assert_eq!(store.acknowledged_ids(&key("s")).unwrap(), vec![id]);
    }

    #[test]
    fn unsubscribe_discards_acknowledged_set() {
        let store = InMemorySubscriptionStore::new();
        store.create(&key("s"), info()).unwrap();
        store.acknowledge(&key("s"), &MessageId::from("X")).unwrap();

        assert!(store.unsubscribe(&key("s")).unwrap());
        assert!(!store.unsubscribe(&key("s")).unwrap());
        assert!(store.subscription(&key("s")).unwrap().is_none());

        store.create(&key("s"), info()).unwrap();
        assert!(store.acknowledged_ids(&key("s")).unwrap().is_empty());
    }

    #[test]
    fn create_twice_fails() {
        let store = InMemorySubscriptionStore::new();
        store.create(&key("s"), info()).unwrap();
        assert!(matches!(
            store.create(&key("s"), info()),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.subscriptions().unwrap().len(), 1);
    }
}
