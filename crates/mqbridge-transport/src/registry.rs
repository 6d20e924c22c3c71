//! ---
//! mqb_section: "02-transport-boundary"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Transport handles, samples, and provider registry."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::memory::InMemoryTransport;
use crate::transport::TransportBinding;
use crate::{Result, TransportError};

/// Explicit table of transport providers, built once at startup and passed
/// to whoever needs to open connections.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    providers: BTreeMap<String, Arc<dyn TransportBinding>>,
}

impl TransportRegistry {
    /// Registry with no providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the statically known providers.
    pub fn with_defaults(history_depth: usize) -> Self {
        let mut registry = Self::new();
        let memory = InMemoryTransport::with_history(history_depth);
        registry.register(memory.name(), Arc::new(memory));
        registry
    }

    /// Add or replace a provider, returning the one previously registered under `kind`.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        binding: Arc<dyn TransportBinding>,
    ) -> Option<Arc<dyn TransportBinding>> {
        self.providers.insert(kind.into(), binding)
    }

    /// Look up a provider by kind.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn TransportBinding>> {
        self.providers
            .get(kind)
            .cloned()
            .ok_or_else(|| TransportError::UnknownKind(kind.to_owned()))
    }

    /// Registered provider kinds in lexical order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
