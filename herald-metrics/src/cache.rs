//! Transport cache metrics

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

/// Transport cache metrics collector
#[derive(Debug)]
pub struct CacheMetrics {
    hits: Counter<u64>,
    misses: Counter<u64>,
    evictions: Counter<u64>,
    loads: Counter<u64>,
    load_duration: Histogram<f64>,
    refreshes: Counter<u64>,
}

impl CacheMetrics {
    /// Create a new cache metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        Ok(Self {
            hits: meter
                .u64_counter("herald.cache.hits.total")
                .with_description("Transport cache hits")
                .build(),
            misses: meter
                .u64_counter("herald.cache.misses.total")
                .with_description("Transport cache misses")
                .build(),
            evictions: meter
                .u64_counter("herald.cache.evictions.total")
                .with_description("Transports evicted by size, expiry or cleanup")
                .build(),
            loads: meter
                .u64_counter("herald.cache.loads.total")
                .with_description("Transport constructions by outcome")
                .build(),
            load_duration: meter
                .f64_histogram("herald.cache.load.duration.seconds")
                .with_description("Time taken to construct a transport")
                .build(),
            refreshes: meter
                .u64_counter("herald.cache.refreshes.total")
                .with_description("Background refresh-ahead rebuilds started")
                .build(),
        })
    }

    pub fn record_hit(&self) {
        self.hits.add(1, &[]);
    }

    pub fn record_miss(&self) {
        self.misses.add(1, &[]);
    }

    /// Record `count` evictions for `cause` (`size`, `expired` or `cleared`)
    pub fn record_evictions(&self, cause: &str, count: u64) {
        if count > 0 {
            self.evictions
                .add(count, &[KeyValue::new("cause", cause.to_string())]);
        }
    }

    pub fn record_load(&self, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.loads
            .add(1, &[KeyValue::new("outcome", outcome)]);
        self.load_duration.record(duration_secs, &[]);
    }

    pub fn record_refresh(&self) {
        self.refreshes.add(1, &[]);
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("herald.cache")
}
