//! ---
//! mqb_section: "03-durable-subscriptions"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Durable subscription records and acknowledgement persistence."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use mqbridge_transport::{Destination, MessageId, SubscriptionKey};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Parameters a durable subscription was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Topic the subscription listens on.
    pub topic: Destination,
    /// Opaque selector string, if any.
    #[serde(default)]
    pub selector: Option<String>,
    /// Whether samples from the owning connection are suppressed.
    #[serde(default)]
    pub no_local: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl SubscriptionInfo {
    /// Describe a subscription created now.
    pub fn new(topic: Destination, selector: Option<String>, no_local: bool) -> Self {
        Self {
            topic,
            selector,
            no_local,
            created_at: Utc::now(),
        }
    }

    /// Explain why `requested` cannot reuse this record, or `None` if it can.
    pub fn mismatch(&self, requested: &SubscriptionInfo) -> Option<String> {
        if self.topic != requested.topic {
            return Some(format!(
                "created on {}, requested on {}",
                self.topic, requested.topic
            ));
        }
        if self.selector != requested.selector {
            return Some(format!(
                "created with selector {:?}, requested with {:?}",
                self.selector, requested.selector
            ));
        }
        if self.no_local != requested.no_local {
            return Some(format!(
                "created with noLocal={}, requested with noLocal={}",
                self.no_local, requested.no_local
            ));
        }
        None
    }
}

/// Listing entry returned by [`SubscriptionStore::subscriptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSummary {
    /// Subscription identity.
    pub key: SubscriptionKey,
    /// Creation parameters.
    pub info: SubscriptionInfo,
    /// Number of acknowledged message identifiers recorded.
    pub acknowledged: usize,
}

/// External persistence of acknowledged message identifiers, keyed by
/// subscription identity.
///
/// Implementations must make [`SubscriptionStore::acknowledge`] durable
/// before returning `Ok`, and must not report an identifier as acknowledged
/// unless that write succeeded.
pub trait SubscriptionStore: Send + Sync {
    /// Creation parameters of a subscription, if a record exists.
    fn subscription(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionInfo>>;
    /// Create an empty record. Fails if one already exists.
    fn create(&self, key: &SubscriptionKey, info: SubscriptionInfo) -> Result<()>;
    /// Whether `id` was acknowledged through `key`.
    fn is_acknowledged(&self, key: &SubscriptionKey, id: &MessageId) -> Result<bool>;
    /// Record `id` as acknowledged through `key`. Recording an id twice is a no-op.
    fn acknowledge(&self, key: &SubscriptionKey, id: &MessageId) -> Result<()>;
    /// Delete the record. Returns `false` if there was none.
    fn unsubscribe(&self, key: &SubscriptionKey) -> Result<bool>;
    /// Acknowledged identifiers of a subscription, in acknowledgement order.
    fn acknowledged_ids(&self, key: &SubscriptionKey) -> Result<Vec<MessageId>>;
    /// Every record in the store, ordered by key.
    fn subscriptions(&self) -> Result<Vec<SubscriptionSummary>>;
}
