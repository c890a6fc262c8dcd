//! Bounded, time-aware cache of live transports
//!
//! Entries are keyed by [`DomainKey`] and follow three rules:
//!
//! - **Size bound**: at most `max_size` entries. Inserting into a full cache
//!   evicts the least recently used entry, never the `"default"` one.
//! - **Expire after write**: an entry older than `expire_after_write_ms` is
//!   dropped on its next access and rebuilt synchronously.
//! - **Refresh ahead**: an entry older than `refresh_after_write_ms` but not
//!   yet expired is returned as-is while a background task rebuilds it.
//!
//! Construction for a key is single-flight: concurrent misses for the same key
//! wait on one per-key lock and reuse whatever the first caller built. A failed
//! construction is reported to the caller and leaves nothing behind, so the
//! next call tries again.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures_util::future::join_all;
use herald_common::{DomainKey, internal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, time::Instant};

use super::{ConfigLookup, Connector, Transport, TransportConfig};
use crate::error::DispatchError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Most transports held at once
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Entry lifetime after construction, in milliseconds
    #[serde(default = "default_expire_after_write_ms")]
    pub expire_after_write_ms: u64,

    /// Age after which an entry is rebuilt in the background, in milliseconds
    #[serde(default = "default_refresh_after_write_ms")]
    pub refresh_after_write_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            expire_after_write_ms: default_expire_after_write_ms(),
            refresh_after_write_ms: default_refresh_after_write_ms(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn expire_after_write(&self) -> Duration {
        Duration::from_millis(self.expire_after_write_ms)
    }

    #[must_use]
    pub const fn refresh_after_write(&self) -> Duration {
        Duration::from_millis(self.refresh_after_write_ms)
    }
}

const fn default_max_size() -> usize {
    1000
}

const fn default_expire_after_write_ms() -> u64 {
    60 * 60 * 1000
}

const fn default_refresh_after_write_ms() -> u64 {
    30 * 60 * 1000
}

/// A transport handle together with the configuration it was built from
#[derive(Debug, Clone)]
pub struct CachedTransport {
    pub transport: Arc<dyn Transport>,
    pub config: Arc<TransportConfig>,
}

#[derive(Debug)]
struct Entry {
    value: CachedTransport,
    written_at: Instant,
    /// Logical clock value of the latest access, for LRU ordering
    last_access: AtomicU64,
    refreshing: AtomicBool,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    load_nanos: AtomicU64,
    refreshes: AtomicU64,
}

/// Cumulative cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by the size bound, by expiry or by invalidation
    pub evictions: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    /// Time spent constructing transports, successful or not
    pub total_load_time: Duration,
    /// Background rebuilds started
    pub refreshes: u64,
    /// Entries currently held
    pub size: usize,
}

impl CacheStats {
    /// Mean time spent per construction attempt
    #[must_use]
    pub fn average_load_penalty(&self) -> Duration {
        let loads = self.load_successes + self.load_failures;
        if loads == 0 {
            return Duration::ZERO;
        }

        let nanos = self.total_load_time.as_nanos() / u128::from(loads);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let requests = self.hits + self.misses;
        if requests == 0 {
            return 0.0;
        }
        self.hits as f64 / requests as f64
    }
}

/// Outcome of [`TransportCache::preload`]
#[derive(Debug, Default)]
pub struct PreloadReport {
    /// Domains now present in the cache
    pub loaded: usize,
    /// Domains that could not be built, with the reason
    pub failed: Vec<(DomainKey, String)>,
}

struct Shared {
    config: CacheConfig,
    lookup: Arc<dyn ConfigLookup>,
    connector: Arc<dyn Connector>,
    entries: DashMap<DomainKey, Arc<Entry>>,
    /// Per-key construction locks, present only while a construction is pending
    loading: DashMap<DomainKey, Arc<tokio::sync::Mutex<()>>>,
    /// Serialises insertions so the size bound holds under concurrent misses
    insertion: Mutex<()>,
    clock: AtomicU64,
    counters: Counters,
}

/// Shared, cloneable transport cache
#[derive(Clone)]
pub struct TransportCache {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TransportCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCache")
            .field("config", &self.shared.config)
            .field("size", &self.shared.entries.len())
            .finish_non_exhaustive()
    }
}

impl TransportCache {
    #[must_use]
    pub fn new(
        config: CacheConfig,
        lookup: Arc<dyn ConfigLookup>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                lookup,
                connector,
                entries: DashMap::new(),
                loading: DashMap::new(),
                insertion: Mutex::new(()),
                clock: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Get the transport for `domain`, building it on a miss
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ConfigLookup`] if neither the domain's nor the
    /// default configuration could be resolved, or [`DispatchError::Transport`]
    /// if the connector failed.
    pub async fn get(&self, domain: &DomainKey) -> Result<CachedTransport, DispatchError> {
        let shared = &self.shared;

        if let Some((entry, age)) = shared.fresh(domain) {
            shared.counters.hits.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = herald_metrics::try_metrics() {
                metrics.cache.record_hit();
            }

            if age >= shared.config.refresh_after_write()
                && !entry.refreshing.swap(true, Ordering::AcqRel)
            {
                self.spawn_refresh(domain.clone(), Arc::clone(&entry));
            }

            return Ok(entry.value.clone());
        }

        shared.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.cache.record_miss();
        }

        let key_lock = KeyLock::new(shared, domain);
        let _guard = key_lock.lock.lock().await;

        // Another caller may have finished building while we waited
        if let Some((entry, _)) = shared.fresh(domain) {
            return Ok(entry.value.clone());
        }

        let value = shared.load(domain).await?;
        shared.insert(domain, value.clone());
        Ok(value)
    }

    fn spawn_refresh(&self, domain: DomainKey, stale: Arc<Entry>) {
        let Ok(runtime) = Handle::try_current() else {
            stale.refreshing.store(false, Ordering::Release);
            return;
        };

        let shared = Arc::clone(&self.shared);
        shared.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.cache.record_refresh();
        }

        runtime.spawn(async move {
            let key_lock = KeyLock::new(&shared, &domain);
            let _guard = key_lock.lock.lock().await;

            match shared.load(&domain).await {
                Ok(value) => {
                    if shared.replace(&domain, value) {
                        internal!("Refreshed transport for {domain}");
                    }
                }
                Err(error) => {
                    tracing::warn!(%domain, %error, "Background transport refresh failed");
                    stale.refreshing.store(false, Ordering::Release);
                }
            }
        });
    }

    /// Drop every entry except `"default"`, returning how many were removed
    pub fn invalidate_all(&self) -> usize {
        let before = self.shared.entries.len();
        self.shared.entries.retain(|key, _| key.is_default());
        let removed = before.saturating_sub(self.shared.entries.len());

        self.shared.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.cache.record_evictions("cleared", removed as u64);
        }
        internal!(level = DEBUG, "Invalidated {removed} cached transports");

        removed
    }

    /// Administrative alias for [`TransportCache::invalidate_all`]
    pub fn clear(&self) -> usize {
        self.invalidate_all()
    }

    /// Build transports for `domains` ahead of use
    ///
    /// Failures are collected, never propagated; every domain is attempted.
    pub async fn preload<I>(&self, domains: I) -> PreloadReport
    where
        I: IntoIterator<Item = DomainKey>,
    {
        let results = join_all(domains.into_iter().map(|domain| async move {
            let result = self.get(&domain).await;
            (domain, result)
        }))
        .await;

        let mut report = PreloadReport::default();
        for (domain, result) in results {
            match result {
                Ok(_) => report.loaded += 1,
                Err(error) => {
                    tracing::warn!(%domain, %error, "Failed to preload transport");
                    report.failed.push((domain, error.to_string()));
                }
            }
        }

        tracing::info!(
            loaded = report.loaded,
            failed = report.failed.len(),
            "Transport preload complete"
        );
        report
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.shared.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            load_successes: counters.load_successes.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            total_load_time: Duration::from_nanos(counters.load_nanos.load(Ordering::Relaxed)),
            refreshes: counters.refreshes.load(Ordering::Relaxed),
            size: self.shared.entries.len(),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn contains(&self, domain: &DomainKey) -> bool {
        self.shared.entries.contains_key(domain)
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }
}

impl Shared {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// The unexpired entry for `domain` and its age, touching it
    ///
    /// An expired entry is removed and counted as an eviction.
    fn fresh(&self, domain: &DomainKey) -> Option<(Arc<Entry>, Duration)> {
        let entry = self.entries.get(domain).map(|entry| Arc::clone(&entry))?;
        let age = entry.written_at.elapsed();

        if age >= self.config.expire_after_write() {
            if self
                .entries
                .remove_if(domain, |_, current| Arc::ptr_eq(current, &entry))
                .is_some()
            {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = herald_metrics::try_metrics() {
                    metrics.cache.record_evictions("expired", 1);
                }
                internal!("Transport for {domain} expired");
            }
            return None;
        }

        entry.last_access.store(self.tick(), Ordering::Relaxed);
        Some((entry, age))
    }

    /// Resolve configuration and connect, recording load statistics
    async fn load(&self, domain: &DomainKey) -> Result<CachedTransport, DispatchError> {
        let started = Instant::now();
        let result = self.build(domain).await;
        let elapsed = started.elapsed();

        self.counters.load_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        let counter = if result.is_ok() {
            &self.counters.load_successes
        } else {
            &self.counters.load_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.cache.record_load(result.is_ok(), elapsed.as_secs_f64());
        }

        result
    }

    async fn build(&self, domain: &DomainKey) -> Result<CachedTransport, DispatchError> {
        let config = match self.lookup.resolve(domain).await {
            Ok(config) => config,
            Err(error) if !domain.is_default() => {
                tracing::debug!(%domain, %error, "Using default transport configuration");
                self.lookup.resolve(&DomainKey::default_key()).await?
            }
            Err(error) => return Err(error.into()),
        };

        let transport = self.connector.connect(&config).await?;
        internal!(
            level = DEBUG,
            "Built transport for {domain} via {}",
            config.address()
        );

        Ok(CachedTransport {
            transport,
            config: Arc::new(config),
        })
    }

    fn entry(&self, value: CachedTransport) -> Arc<Entry> {
        Arc::new(Entry {
            value,
            written_at: Instant::now(),
            last_access: AtomicU64::new(self.tick()),
            refreshing: AtomicBool::new(false),
        })
    }

    /// Insert, evicting as needed; returns whether the value was cached
    fn insert(&self, domain: &DomainKey, value: CachedTransport) -> bool {
        let _insertion = self.insertion.lock();

        if !self.entries.contains_key(domain) {
            while self.entries.len() >= self.config.max_size {
                if !self.evict_one(domain) {
                    tracing::debug!(%domain, "No evictable transport, not caching");
                    return false;
                }
            }
        }

        self.entries.insert(domain.clone(), self.entry(value));
        true
    }

    /// Swap in a rebuilt value if the key is still cached
    fn replace(&self, domain: &DomainKey, value: CachedTransport) -> bool {
        let _insertion = self.insertion.lock();

        self.entries.get_mut(domain).is_some_and(|mut slot| {
            *slot = self.entry(value);
            true
        })
    }

    /// Remove the least recently used entry other than `"default"` and `incoming`
    fn evict_one(&self, incoming: &DomainKey) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|entry| !entry.key().is_default() && entry.key() != incoming)
            .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        let Some(victim) = victim else {
            return false;
        };

        if self.entries.remove(&victim).is_some() {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = herald_metrics::try_metrics() {
                metrics.cache.record_evictions("size", 1);
            }
            internal!("Evicted transport for {victim}");
        }

        true
    }
}

/// Holds the construction lock for one key; removes it from the table once
/// no one else is waiting on it
struct KeyLock<'a> {
    shared: &'a Shared,
    domain: DomainKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> KeyLock<'a> {
    fn new(shared: &'a Shared, domain: &DomainKey) -> Self {
        let lock = Arc::clone(
            &shared
                .loading
                .entry(domain.clone())
                .or_insert_with(Arc::default),
        );

        Self {
            shared,
            domain: domain.clone(),
            lock,
        }
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.shared.loading.remove_if(&self.domain, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::{ConfigLookupError, TransportError},
        transport::{OutboundMessage, StaticTransports},
    };

    #[derive(Debug)]
    struct Null;

    #[async_trait]
    impl Transport for Null {
        async fn send(&self, _: &OutboundMessage) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicU64,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            _: &TransportConfig,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Arc::new(Null))
        }
    }

    fn cache(config: CacheConfig, lookup: StaticTransports) -> (TransportCache, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector::default());
        (
            TransportCache::new(config, Arc::new(lookup), connector.clone()),
            connector,
        )
    }

    fn small(max_size: usize) -> CacheConfig {
        CacheConfig {
            max_size,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (cache, connector) = cache(CacheConfig::default(), StaticTransports::default());
        let key = DomainKey::new("newco.com");

        cache.get(&key).await.unwrap();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.load_successes), (0, 1, 1));

        cache.get(&key).await.unwrap();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_domain_uses_default_config() {
        let default = TransportConfig {
            host: "fallback.relay".to_string(),
            ..TransportConfig::default()
        };
        let (cache, _) = cache(CacheConfig::default(), StaticTransports::new(default));

        let cached = cache.get(&DomainKey::new("unknown.test")).await.unwrap();
        assert_eq!(cached.config.host, "fallback.relay");
    }

    #[tokio::test]
    async fn test_failure_surfaces_and_is_retried() {
        let lookup = StaticTransports::new(TransportConfig {
            host: String::new(),
            ..TransportConfig::default()
        });
        let (cache, _) = cache(CacheConfig::default(), lookup);
        let key = DomainKey::new("broken.test");

        let error = cache.get(&key).await.unwrap_err();
        assert!(matches!(
            error,
            DispatchError::ConfigLookup(ConfigLookupError::Invalid { .. })
        ));
        assert!(!cache.contains(&key));

        cache.get(&key).await.unwrap_err();
        assert_eq!(cache.stats().load_failures, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_construction() {
        let (cache, connector) = cache(CacheConfig::default(), StaticTransports::default());
        let key = DomainKey::new("popular.test");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move { cache.get(&key).await.map(|_| ()) })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(cache.shared.loading.is_empty());
    }

    #[tokio::test]
    async fn test_size_bound_never_evicts_default() {
        let (cache, _) = cache(small(3), StaticTransports::default());
        cache.get(&DomainKey::default_key()).await.unwrap();

        for n in 0..10 {
            cache.get(&DomainKey::new(&format!("d{n}.test"))).await.unwrap();
            assert!(cache.size() <= 3);
            assert!(cache.contains(&DomainKey::default_key()));
        }

        assert_eq!(cache.stats().evictions, 8);
    }

    #[tokio::test]
    async fn test_least_recently_used_is_evicted() {
        let (cache, _) = cache(small(2), StaticTransports::default());
        let (a, b, c) = (DomainKey::new("a.test"), DomainKey::new("b.test"), DomainKey::new("c.test"));

        cache.get(&a).await.unwrap();
        cache.get(&b).await.unwrap();
        cache.get(&a).await.unwrap();
        cache.get(&c).await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_rebuilt() {
        let config = CacheConfig {
            expire_after_write_ms: 1000,
            refresh_after_write_ms: 5000,
            ..CacheConfig::default()
        };
        let (cache, connector) = cache(config, StaticTransports::default());
        let key = DomainKey::new("expiring.test");

        cache.get(&key).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        cache.get(&key).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_ahead_returns_stale_and_rebuilds() {
        let config = CacheConfig {
            expire_after_write_ms: 10_000,
            refresh_after_write_ms: 1_000,
            ..CacheConfig::default()
        };
        let (cache, connector) = cache(config, StaticTransports::default());
        let key = DomainKey::new("refresh.test");

        let first = cache.get(&key).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        let stale = cache.get(&key).await.unwrap();
        assert!(Arc::ptr_eq(&first.transport, &stale.transport));
        assert_eq!(cache.stats().refreshes, 1);

        // Let the background rebuild finish
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        let fresh = cache.get(&key).await.unwrap();
        assert!(!Arc::ptr_eq(&first.transport, &fresh.transport));
        assert_eq!(cache.stats().refreshes, 1);
    }

    #[tokio::test]
    async fn test_invalidate_all_keeps_default() {
        let (cache, _) = cache(CacheConfig::default(), StaticTransports::default());
        cache.get(&DomainKey::default_key()).await.unwrap();
        cache.get(&DomainKey::new("a.test")).await.unwrap();
        cache.get(&DomainKey::new("b.test")).await.unwrap();

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.size(), 1);
        assert!(cache.contains(&DomainKey::default_key()));
        assert_eq!(cache.stats().evictions, 2);

        assert_eq!(cache.invalidate_all(), 0);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_preload_tolerates_failures() {
        let lookup = StaticTransports::new(TransportConfig {
            port: 0,
            ..TransportConfig::default()
        })
        .with_domain("a.test", TransportConfig::default())
        .with_domain("b.test", TransportConfig::default());
        let (cache, _) = cache(CacheConfig::default(), lookup);

        let report = cache
            .preload(["a.test", "unconfigured.test", "b.test"].map(DomainKey::new))
            .await;

        assert_eq!(report.loaded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.as_str(), "unconfigured.test");
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_stats_derivations() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            load_successes: 3,
            load_failures: 1,
            total_load_time: Duration::from_millis(400),
            ..CacheStats::default()
        };

        assert_eq!(stats.average_load_penalty(), Duration::from_millis(100));
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().average_load_penalty(), Duration::ZERO);
    }
}
