//! ---
//! mqb_section: "03-durable-subscriptions"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Durable subscription records and acknowledgement persistence."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Persistence of acknowledged message identifiers per durable subscription.
//!
//! A message identifier recorded here must never reach the application again
//! through the same subscription identity, so every write is made durable
//! before it is reported as successful.
#![warn(missing_docs)]

use std::path::PathBuf;

use mqbridge_transport::SubscriptionKey;

pub mod file;
pub mod memory;
pub mod store;

/// Result alias used throughout the durable store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for durable subscription stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrapper for IO errors encountered while reading/writing subscription logs.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The subscription has no record in the store.
    #[error("unknown durable subscription {0}")]
    UnknownSubscription(SubscriptionKey),
    /// A record already exists for the subscription.
    #[error("durable subscription {0} already exists")]
    AlreadyExists(SubscriptionKey),
    /// A subscription log failed validation while loading.
    #[error("corrupt subscription log {path}: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },
    /// The backing medium rejected the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub use file::FileSubscriptionStore;
pub use memory::InMemorySubscriptionStore;
pub use store::{SubscriptionInfo, SubscriptionStore, SubscriptionSummary};

#[cfg(test)]
mod tests {
    use super::*;
    use mqbridge_transport::ClientId;

    #[test]
    fn error_messages_name_the_subscription() {
        let key = SubscriptionKey::new(ClientId::new("client-a"), "orders");
        let err = StoreError::UnknownSubscription(key);
        assert_eq!(err.to_string(), "unknown durable subscription client-a/orders");
    }
}
