//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mqbridge_common::{BridgeConfig, StoreKind};
use mqbridge_durable::{FileSubscriptionStore, InMemorySubscriptionStore, SubscriptionStore};
use mqbridge_logging::{bridge_warn, log_lifecycle_event, LifecycleOutcome};
use mqbridge_transport::{ClientId, ConnectionId, TransportBinding, TransportRegistry};
use parking_lot::{Mutex, MutexGuard};
use tracing::info;

use crate::metrics::BridgeMetrics;
use crate::selector::SelectorEvaluator;
use crate::session::{AcknowledgeMode, Session, SessionShared};
use crate::{BridgeError, Result};

/// Receives errors raised while delivering to message listeners.
pub type ExceptionListener = Arc<dyn Fn(&BridgeError) + Send + Sync>;

/// Fallback batch size for DUPS_OK sessions.
pub const DEFAULT_DUPS_OK_BATCH: usize = 32;

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    transport: Arc<dyn TransportBinding>,
    client_id: Option<ClientId>,
    store: Option<Arc<dyn SubscriptionStore>>,
    selector: Option<Arc<dyn SelectorEvaluator>>,
    metrics: Option<BridgeMetrics>,
    dups_ok_batch: usize,
}

impl ConnectionBuilder {
    /// Start a builder over `transport`.
    pub fn new(transport: Arc<dyn TransportBinding>) -> Self {
        Self {
            transport,
            client_id: None,
            store: None,
            selector: None,
            metrics: None,
            dups_ok_batch: DEFAULT_DUPS_OK_BATCH,
        }
    }

    /// Client identity; required for durable subscriptions.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(ClientId::new(client_id));
        self
    }

    /// Store for durable subscriptions. Defaults to an in-memory store.
    pub fn subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Evaluator consulted for consumers created with a selector.
    pub fn selector_evaluator(mut self, evaluator: Arc<dyn SelectorEvaluator>) -> Self {
        self.selector = Some(evaluator);
        self
    }

    /// Metrics updated by every session of the connection.
    pub fn metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deliveries a DUPS_OK session accumulates before acknowledging them.
    pub fn dups_ok_batch(mut self, batch: usize) -> Self {
        self.dups_ok_batch = batch.max(1);
        self
    }

    /// Finish the connection.
    pub fn build(self) -> Connection {
        let shared = Arc::new(ConnectionShared {
            id: ConnectionId::generate(),
            client_id: self.client_id,
            transport: self.transport,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemorySubscriptionStore::new())),
            selector: self.selector,
            metrics: self.metrics,
            dups_ok_batch: self.dups_ok_batch,
            exception_listener: Mutex::new(None),
            active_durable: Mutex::new(HashSet::new()),
            sessions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        info!(
            connection = %shared.id,
            transport = shared.transport.name(),
            client_id = shared.client_id.as_ref().map(ClientId::as_str).unwrap_or(""),
            "connection opened"
        );
        Connection { shared }
    }
}

/// Owner of sessions and of the connection-wide collaborators.
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Start building a connection over `transport`.
    pub fn builder(transport: Arc<dyn TransportBinding>) -> ConnectionBuilder {
        ConnectionBuilder::new(transport)
    }

    /// Build a connection from configuration, resolving the transport kind
    /// through `transports`.
    pub fn from_config(config: &BridgeConfig, transports: &TransportRegistry) -> Result<Self> {
        let transport = transports.get(&config.transport.kind)?;
        let store: Arc<dyn SubscriptionStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(InMemorySubscriptionStore::new()),
            StoreKind::File => Arc::new(FileSubscriptionStore::open(&config.store.directory)?),
        };
        let mut builder = Self::builder(transport)
            .subscription_store(store)
            .dups_ok_batch(config.session.dups_ok_batch);
        if let Some(client_id) = &config.client_id {
            builder = builder.client_id(client_id.clone());
        }
        if config.metrics.enabled {
            builder = builder.metrics(BridgeMetrics::standalone()?);
        }
        Ok(builder.build())
    }

    /// Identifier used for no-local filtering.
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Client identity, if one was configured.
    pub fn client_id(&self) -> Option<&ClientId> {
        self.shared.client_id.as_ref()
    }

    /// Metrics shared by the sessions of this connection.
    pub fn metrics(&self) -> Option<&BridgeMetrics> {
        self.shared.metrics.as_ref()
    }

    /// Store backing durable subscriptions.
    pub fn subscription_store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.shared.store
    }

    /// Install or clear the listener for errors raised on transport threads.
    pub fn set_exception_listener(&self, listener: Option<ExceptionListener>) -> Result<()> {
        self.shared.ensure_open()?;
        *self.shared.exception_listener.lock() = listener;
        Ok(())
    }

    /// Open a session with the given acknowledgement mode.
    pub fn create_session(&self, mode: AcknowledgeMode) -> Result<Session> {
        self.shared.ensure_open()?;
        let session = Session::open(Arc::clone(&self.shared), mode);
        let mut sessions = self.shared.sessions.lock();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(session.downgrade());
        Ok(session)
    }

    /// Whether [`Connection::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close every session and the consumers and producers they own. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = std::mem::take(&mut *self.shared.sessions.lock());
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.close();
        }
        log_lifecycle_event(
            None,
            "connection.close",
            &format!("connection {} closed", self.shared.id),
            LifecycleOutcome::Success,
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("client_id", &self.shared.client_id)
            .field("transport", &self.shared.transport.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) client_id: Option<ClientId>,
    pub(crate) transport: Arc<dyn TransportBinding>,
    pub(crate) store: Arc<dyn SubscriptionStore>,
    pub(crate) selector: Option<Arc<dyn SelectorEvaluator>>,
    pub(crate) metrics: Option<BridgeMetrics>,
    pub(crate) dups_ok_batch: usize,
    exception_listener: Mutex<Option<ExceptionListener>>,
    // Durable subscription names held by open consumers.
    active_durable: Mutex<HashSet<String>>,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
    closed: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ConnectionClosed);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn claim_durable(&self, name: &str) -> Result<()> {
        if !self.active_durable.lock().insert(name.to_owned()) {
            return Err(BridgeError::SubscriptionInUse(name.to_owned()));
        }
        Ok(())
    }

    pub(crate) fn release_durable(&self, name: &str) {
        self.active_durable.lock().remove(name);
    }

    /// Hold the durable name table, e.g. across an unsubscribe.
    pub(crate) fn durable_names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active_durable.lock()
    }

    /// Hand an error that has no caller to the exception listener.
    pub(crate) fn report(&self, error: BridgeError) {
        let listener = self.exception_listener.lock().clone();
        match listener {
            Some(listener) => listener(&error),
            None => bridge_warn!("unhandled asynchronous delivery error: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqbridge_transport::InMemoryTransport;

    fn transport() -> Arc<dyn TransportBinding> {
        Arc::new(InMemoryTransport::new())
    }

    #[test]
    fn closed_connection_rejects_new_sessions() {
        let connection = Connection::builder(transport()).build();
        let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
        connection.close();
        connection.close();

        assert!(connection.is_closed());
        assert!(session.is_closed());
        assert!(matches!(
            connection.create_session(AcknowledgeMode::Client),
            Err(BridgeError::ConnectionClosed)
        ));
        assert_eq!(
            connection
                .set_exception_listener(None)
                .unwrap_err()
                .to_string(),
            "This Connection is closed."
        );
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = Connection::builder(transport()).build();
        let b = Connection::builder(transport()).client_id("client-b").build();
        assert_ne!(a.connection_id(), b.connection_id());
        assert!(a.client_id().is_none());
        assert_eq!(b.client_id().map(ClientId::as_str), Some("client-b"));
    }

    #[test]
    fn from_config_resolves_transport_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig {
            client_id: Some("configured".into()),
            ..BridgeConfig::default()
        };
        config.store.kind = StoreKind::File;
        config.store.directory = dir.path().to_path_buf();

        let registry = TransportRegistry::with_defaults(0);
        let connection = Connection::from_config(&config, &registry).unwrap();
        assert_eq!(
            connection.client_id().map(ClientId::as_str),
            Some("configured")
        );
        assert!(connection.metrics().is_some());

        config.transport.kind = "carrier-pigeon".into();
        assert!(matches!(
            Connection::from_config(&config, &registry),
            Err(BridgeError::Transport(_))
        ));
    }

    #[test]
    fn durable_names_are_claimed_once() {
        let connection = Connection::builder(transport()).build();
        connection.shared.claim_durable("orders").unwrap();
        assert!(matches!(
            connection.shared.claim_durable("orders"),
            Err(BridgeError::SubscriptionInUse(_))
        ));
        connection.shared.release_durable("orders");
        connection.shared.claim_durable("orders").unwrap();
    }
}
