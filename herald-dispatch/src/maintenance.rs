//! Periodic cache upkeep
//!
//! On every tick the maintenance loop drops all non-default transports, prunes
//! idle per-domain rate limiters and logs cache statistics. It exits when the
//! controller broadcasts [`Signal::Shutdown`].

use std::time::Duration;

use herald_common::{DomainKey, Signal, internal};
use herald_tracing::traced;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between cleanup passes
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Domains whose transports are built when the loop starts
    #[serde(default)]
    pub preload_domains: Vec<String>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            preload_domains: Vec::new(),
        }
    }
}

const fn default_cleanup_interval_secs() -> u64 {
    3600
}

/// Outcome of a single cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub transports_removed: usize,
    pub limiters_pruned: usize,
}

#[derive(Debug, Clone)]
pub struct CacheMaintenance {
    dispatcher: Dispatcher,
    config: MaintenanceConfig,
}

impl CacheMaintenance {
    #[must_use]
    pub const fn new(dispatcher: Dispatcher, config: MaintenanceConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Run one cleanup pass
    pub fn run_once(&self) -> CleanupReport {
        let transports_removed = self.dispatcher.cache().invalidate_all();
        let limiters_pruned = self.dispatcher.domain_limits().prune_idle();
        let stats = self.dispatcher.cache().stats();

        tracing::info!(
            transports_removed,
            limiters_pruned,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            load_failures = stats.load_failures,
            average_load_ms = u64::try_from(stats.average_load_penalty().as_millis()).unwrap_or(u64::MAX),
            "Transport cache maintenance"
        );

        CleanupReport {
            transports_removed,
            limiters_pruned,
        }
    }

    /// Preload configured domains, then clean up on every interval until shutdown
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Cache maintenance starting");

        if !self.config.preload_domains.is_empty() {
            let domains = self
                .config
                .preload_domains
                .iter()
                .map(|domain| DomainKey::new(domain));
            self.dispatcher.cache().preload(domains).await;
        }

        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_secs.max(1)));

        // Skip the first tick to avoid immediate execution
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_once();
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Cache maintenance received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Cache maintenance lagged behind lifecycle signals");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::error!("Cache maintenance shutdown channel closed");
                            break;
                        }
                    }
                }
            }
        }

        internal!("Cache maintenance stopped");
    }
}
