//! Wiring of the dispatch components
//!
//! One [`DispatchEngine`] is built per process and shared by reference (it is
//! cheap to clone). It owns the single cache, gate, limiters and pool that
//! every send goes through.

use std::sync::Arc;

use herald_common::internal;

use crate::{
    batch::{BatchCoordinator, BulkHandle},
    config::DispatchConfig,
    dispatcher::{DispatchStats, Dispatcher, SendHandle, SendRequest},
    error::DispatchError,
    interrupt::Interrupt,
    maintenance::CacheMaintenance,
    pool::WorkerPool,
    render::{Renderer, Variables},
    transport::{ConfigLookup, Connector, TransportCache},
};

/// Builder for [`DispatchEngine`]
pub struct EngineBuilder {
    config: DispatchConfig,
    lookup: Option<Arc<dyn ConfigLookup>>,
    connector: Option<Arc<dyn Connector>>,
    renderer: Option<Arc<dyn Renderer>>,
    interrupt: Interrupt,
}

impl EngineBuilder {
    /// Configuration source; defaults to the static `transports` section
    #[must_use]
    pub fn lookup(mut self, lookup: Arc<dyn ConfigLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    #[must_use]
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] if the configuration is invalid
    /// or the connector or renderer was not supplied.
    pub fn build(self) -> Result<DispatchEngine, DispatchError> {
        self.config.validate()?;

        let connector = self
            .connector
            .ok_or_else(|| DispatchError::Validation("no transport connector".to_string()))?;
        let renderer = self
            .renderer
            .ok_or_else(|| DispatchError::Validation("no template renderer".to_string()))?;
        let lookup = self
            .lookup
            .unwrap_or_else(|| Arc::new(self.config.transports.clone()));

        let cache = TransportCache::new(self.config.cache.clone(), lookup, connector);
        let pool = WorkerPool::new(&self.config.pool);

        internal!(
            level = INFO,
            "Dispatch engine ready: {} slots, {} permits per {}ms, {} pooled tasks",
            self.config.gate.permits,
            self.config.rate_limit.permits_per_window,
            self.config.rate_limit.window_ms,
            pool.capacity()
        );

        let dispatcher = Dispatcher::new(&self.config, cache, renderer, pool, self.interrupt);
        let batches = BatchCoordinator::new(dispatcher.clone(), self.config.batch.clone());

        Ok(DispatchEngine {
            dispatcher,
            batches,
            config: Arc::new(self.config),
        })
    }
}

/// The assembled dispatch engine
#[derive(Debug, Clone)]
pub struct DispatchEngine {
    dispatcher: Dispatcher,
    batches: BatchCoordinator,
    config: Arc<DispatchConfig>,
}

impl DispatchEngine {
    #[must_use]
    pub fn builder(config: DispatchConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            lookup: None,
            connector: None,
            renderer: None,
            interrupt: Interrupt::never(),
        }
    }

    /// Submit a single send
    pub fn send(&self, request: SendRequest) -> SendHandle {
        self.dispatcher.send(request)
    }

    /// Submit a bulk send with the configured batch size
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] if no usable recipient remains.
    pub fn send_bulk<S: AsRef<str>>(
        &self,
        recipients: &[S],
        subject: &str,
        template: &str,
        variables: &Variables,
    ) -> Result<BulkHandle, DispatchError> {
        self.batches.send_bulk(recipients, subject, template, variables)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn batches(&self) -> &BatchCoordinator {
        &self.batches
    }

    #[must_use]
    pub fn cache(&self) -> &TransportCache {
        self.dispatcher.cache()
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// The periodic cleanup loop for this engine's cache and limiters
    #[must_use]
    pub fn maintenance(&self) -> CacheMaintenance {
        CacheMaintenance::new(self.dispatcher.clone(), self.config.maintenance.clone())
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}
