//! Builder that assembles a [`TaskEngine`] with in-memory defaults.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::core::{
    AuditSink, AuditTrail, DurableStore, EngineError, EngineResult, FastCache, GenerationBackend,
    PointsLedger, TaskEngine,
};
use crate::infra::{InMemoryCache, InMemoryLedger, InMemoryStore};

/// Collects collaborators for a [`TaskEngine`].
///
/// Only the generation backend is mandatory; the store, cache and ledger
/// default to their in-memory implementations.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn DurableStore>>,
    cache: Option<Arc<dyn FastCache>>,
    backend: Option<Arc<dyn GenerationBackend>>,
    ledger: Option<Arc<dyn PointsLedger>>,
    audit: AuditTrail,
}

impl EngineBuilder {
    /// Start from `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            cache: None,
            backend: None,
            ledger: None,
            audit: AuditTrail::disabled(),
        }
    }

    /// Use `store` as the durable store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `cache` as the status cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn FastCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use `backend` for generation.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use `ledger` for billing.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn PointsLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Record lifecycle events into `sink`.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<Mutex<dyn AuditSink>>) -> Self {
        self.audit = AuditTrail::new(sink);
        self
    }

    /// Validate and assemble the engine.
    pub fn build(self) -> EngineResult<TaskEngine> {
        let backend = self
            .backend
            .ok_or_else(|| EngineError::Config("a generation backend is required".into()))?;
        TaskEngine::new(
            self.config,
            self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            self.cache.unwrap_or_else(|| Arc::new(InMemoryCache::new())),
            backend,
            self.ledger.unwrap_or_else(|| Arc::new(InMemoryLedger::new())),
            self.audit,
        )
    }
}
