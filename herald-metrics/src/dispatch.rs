//! Dispatch engine metrics
//!
//! Tracks outbound sends through every stage of the dispatcher:
//! - Attempts by stage and domain
//! - Terminal successes and failures (by error kind)
//! - Rate limiter rejections by scope
//! - Backoff sleeps by reason
//! - Concurrency slots in use

use std::sync::atomic::{AtomicI64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

use crate::{MetricsError, labels::DomainLabels};

/// Dispatch metrics collector
#[derive(Debug)]
pub struct DispatchMetrics {
    attempts_total: Counter<u64>,
    succeeded_total: Counter<u64>,
    failed_total: Counter<u64>,
    rate_limited_total: Counter<u64>,
    backoff_total: Counter<u64>,
    backoff_seconds: Histogram<f64>,
    duration_seconds: Histogram<f64>,
    transport_attempts: Histogram<u64>,
    slots_in_use: UpDownCounter<i64>,
    slots: AtomicI64,
    domains: DomainLabels,
}

impl DispatchMetrics {
    /// Create a new dispatch metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new(
        max_domain_cardinality: usize,
        high_priority_domains: Vec<String>,
    ) -> Result<Self, MetricsError> {
        let meter = meter();

        Ok(Self {
            attempts_total: meter
                .u64_counter("herald.dispatch.attempts.total")
                .with_description("Dispatch attempts by stage and domain")
                .build(),
            succeeded_total: meter
                .u64_counter("herald.dispatch.sends.succeeded.total")
                .with_description("Sends delivered to the transport successfully")
                .build(),
            failed_total: meter
                .u64_counter("herald.dispatch.sends.failed.total")
                .with_description("Sends that ended in failure, by error kind")
                .build(),
            rate_limited_total: meter
                .u64_counter("herald.dispatch.rate_limited.total")
                .with_description("Rate limiter rejections by scope")
                .build(),
            backoff_total: meter
                .u64_counter("herald.dispatch.backoff.total")
                .with_description("Backoff sleeps by reason")
                .build(),
            backoff_seconds: meter
                .f64_histogram("herald.dispatch.backoff.seconds")
                .with_description("Distribution of backoff delays")
                .build(),
            duration_seconds: meter
                .f64_histogram("herald.dispatch.duration.seconds")
                .with_description("Time from slot acquisition to terminal result")
                .build(),
            transport_attempts: meter
                .u64_histogram("herald.dispatch.transport.attempts")
                .with_description("Transport attempts needed per send")
                .build(),
            slots_in_use: meter
                .i64_up_down_counter("herald.dispatch.slots.in_use")
                .with_description("Concurrency slots currently held")
                .build(),
            slots: AtomicI64::new(0),
            domains: DomainLabels::new(max_domain_cardinality, high_priority_domains),
        })
    }

    /// Record that a send reached `stage`
    pub fn record_attempt(&self, stage: &str, domain: &str) {
        self.attempts_total.add(
            1,
            &[
                KeyValue::new("stage", stage.to_string()),
                KeyValue::new("domain", self.domains.label(domain)),
            ],
        );
    }

    /// Record a successful send
    pub fn record_success(&self, domain: &str, duration_secs: f64, attempts: u64) {
        let attributes = [KeyValue::new("domain", self.domains.label(domain))];
        self.succeeded_total.add(1, &attributes);
        self.duration_seconds.record(duration_secs, &attributes);
        self.transport_attempts.record(attempts, &[]);
    }

    /// Record a terminal failure of kind `kind`
    pub fn record_failure(&self, kind: &str, domain: &str) {
        self.failed_total.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("domain", self.domains.label(domain)),
            ],
        );
    }

    /// Record a rejected rate limiter acquisition (`scope` is `global` or `domain`)
    pub fn record_rate_limited(&self, scope: &str) {
        self.rate_limited_total
            .add(1, &[KeyValue::new("scope", scope.to_string())]);
    }

    /// Record a backoff sleep
    pub fn record_backoff(&self, reason: &str, delay_secs: f64) {
        let attributes = [KeyValue::new("reason", reason.to_string())];
        self.backoff_total.add(1, &attributes);
        self.backoff_seconds.record(delay_secs, &attributes);
    }

    pub fn record_slot_acquired(&self) {
        self.slots_in_use.add(1, &[]);
        self.slots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slot_released(&self) {
        self.slots_in_use.add(-1, &[]);
        self.slots.fetch_sub(1, Ordering::Relaxed);
    }

    /// Slots currently held, as seen by the metrics layer
    #[must_use]
    pub fn slots_in_use(&self) -> i64 {
        self.slots.load(Ordering::Relaxed)
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("herald.dispatch")
}
