//! Bound on in-flight sends
//!
//! The gate is a fair counting semaphore: waiters are served in arrival order,
//! acquisition gives up after a timeout, and the slot is released when the
//! returned [`SlotPermit`] is dropped, on every exit path.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::{error::DispatchError, interrupt::Interrupt};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Total sending slots
    #[serde(default = "default_permits")]
    pub permits: usize,

    /// How long a send waits for a slot, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            permits: default_permits(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl GateConfig {
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

const fn default_permits() -> usize {
    100
}

const fn default_acquire_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    timeouts: AtomicU64,
}

/// Counting semaphore bounding concurrent sends
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl ConcurrencyGate {
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            capacity: permits,
            counters: Arc::default(),
        }
    }

    /// Wait up to `timeout` for a slot
    ///
    /// # Errors
    ///
    /// - [`DispatchError::SlotTimeout`] if no slot frees up in time
    /// - [`DispatchError::Interrupted`] if shutdown was requested while waiting
    pub async fn acquire(
        &self,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<SlotPermit, DispatchError> {
        let acquire = tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned());

        match interrupt.run(acquire).await? {
            Ok(Ok(permit)) => Ok(self.admit(permit)),
            Ok(Err(_closed)) => Err(DispatchError::Interrupted(
                "sending slots closed".to_string(),
            )),
            Err(_elapsed) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::SlotTimeout(timeout))
            }
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.admit(permit)),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> SlotPermit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.dispatch.record_slot_acquired();
        }

        SlotPermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever held at once
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Acquisitions that gave up waiting
    pub fn timeouts(&self) -> u64 {
        self.counters.timeouts.load(Ordering::Relaxed)
    }
}

/// An occupied slot; released on drop
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.dispatch.record_slot_released();
        }
    }
}
