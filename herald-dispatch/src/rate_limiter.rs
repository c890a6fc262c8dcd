//! Fixed-window rate limiting
//!
//! A [`RateLimiter`] hands out `permits_per_window` tokens, all of which come
//! back at once when the window rolls over. Acquisition never queues: a caller
//! either gets a token, waits at most `max_wait_ms` for the next window, or is
//! refused and retries through its own retry loop.
//!
//! # Example
//!
//! ```text
//! Rate limit: 100 permits per 1000 ms
//! - Window opens with 100 permits
//! - The 101st acquisition in that window is refused
//! - At the next window boundary the counter is back at 100
//! ```
//!
//! Limiters are independent per scope. The dispatcher holds one global limiter
//! and a [`RateLimiterRegistry`] holding one limiter per destination domain.
//!
//! The registry tracks at most `max_domains` domains individually. When the
//! table is full, idle limiters are pruned first; only if none can go does a
//! new domain fall back to a single limiter shared by every such domain. Those
//! domains can then crowd each other out, so `max_domains` should sit well
//! above the number of domains expected within `idle_after_secs`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use dashmap::DashMap;
use herald_common::DomainKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{error::Interrupted, interrupt::Interrupt};

/// Configuration for a single limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Permits granted per window
    #[serde(default = "default_permits_per_window")]
    pub permits_per_window: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Longest an acquisition may wait for the next window, in milliseconds.
    /// Zero makes acquisition non-blocking.
    #[serde(default)]
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits_per_window: default_permits_per_window(),
            window_ms: default_window_ms(),
            max_wait_ms: 0,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

const fn default_permits_per_window() -> u32 {
    100
}

const fn default_window_ms() -> u64 {
    1000
}

/// Per-domain limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRateLimits {
    /// Limits applied to any domain without an override
    #[serde(default)]
    pub default: RateLimitConfig,

    /// Per-domain overrides, keyed by lower-cased domain
    #[serde(default)]
    pub overrides: AHashMap<String, RateLimitConfig>,

    /// Most distinct domains tracked individually; further domains share one limiter
    #[serde(default = "default_max_domains")]
    pub max_domains: usize,

    /// Limiters unused for this many seconds are pruned
    #[serde(default = "default_idle_after_secs")]
    pub idle_after_secs: u64,
}

impl Default for DomainRateLimits {
    fn default() -> Self {
        Self {
            default: RateLimitConfig::default(),
            overrides: AHashMap::default(),
            max_domains: default_max_domains(),
            idle_after_secs: default_idle_after_secs(),
        }
    }
}

const fn default_max_domains() -> usize {
    10_000
}

const fn default_idle_after_secs() -> u64 {
    3600
}

/// The current window of a limiter
#[derive(Debug)]
struct Window {
    /// Permits left in this window
    remaining: u32,
    /// When the window rolls over
    resets_at: Instant,
    /// Last time a token was requested
    last_used: Instant,
}

impl Window {
    fn new(permits: u32, length: Duration) -> Self {
        let now = Instant::now();
        Self {
            remaining: permits,
            resets_at: now + length,
            last_used: now,
        }
    }

    fn roll(&mut self, now: Instant, permits: u32, length: Duration) {
        if now >= self.resets_at {
            self.remaining = permits;
            // Align to the window grid so a late caller does not stretch the window
            let behind = now.duration_since(self.resets_at);
            let skipped = behind.as_nanos() / length.as_nanos().max(1);
            let skipped = u32::try_from(skipped).unwrap_or(u32::MAX);
            self.resets_at += length.saturating_mul(skipped.saturating_add(1));
        }
    }
}

/// A single fixed-window limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
    granted: AtomicU64,
    refused: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let window = Window::new(config.permits_per_window, config.window());
        Self {
            config,
            window: Mutex::new(window),
            granted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take a token if one is left in the current window
    ///
    /// Returns `Ok(())` if allowed, `Err(Duration)` with the time until the
    /// window resets otherwise.
    fn check(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.last_used = now;
        window.roll(now, self.config.permits_per_window, self.config.window());

        if window.remaining > 0 {
            window.remaining -= 1;
            Ok(())
        } else {
            Err(window.resets_at.saturating_duration_since(now))
        }
    }

    /// Non-blocking acquisition, ignoring `max_wait_ms`
    pub fn try_acquire(&self) -> bool {
        let granted = self.check().is_ok();
        self.count(granted);
        granted
    }

    /// Acquire a token, waiting at most `max_wait_ms` for the next window
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if shutdown was requested while waiting.
    pub async fn acquire(&self, interrupt: &Interrupt) -> Result<bool, Interrupted> {
        let max_wait = self.config.max_wait();

        let granted = match self.check() {
            Ok(()) => true,
            Err(wait) if !max_wait.is_zero() && wait <= max_wait => {
                interrupt.sleep(wait).await?;
                self.check().is_ok()
            }
            Err(wait) => {
                tracing::trace!(
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Rate limit window exhausted"
                );
                false
            }
        };

        self.count(granted);
        Ok(granted)
    }

    fn count(&self, granted: bool) {
        if granted {
            self.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refused.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.window.lock().last_used)
    }

    /// Snapshot of this limiter's state
    pub fn stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.roll(now, self.config.permits_per_window, self.config.window());

        RateLimitStats {
            available: window.remaining,
            capacity: self.config.permits_per_window,
            resets_in: window.resets_at.saturating_duration_since(now),
            granted: self.granted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for a limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Permits left in the current window
    pub available: u32,
    /// Permits per window
    pub capacity: u32,
    /// Time until the window resets
    pub resets_in: Duration,
    /// Tokens handed out since creation
    pub granted: u64,
    /// Requests refused since creation
    pub refused: u64,
}

/// Lazily created per-domain limiters
#[derive(Debug)]
pub struct RateLimiterRegistry {
    config: DomainRateLimits,
    /// `config.overrides` with normalised keys
    overrides: AHashMap<DomainKey, RateLimitConfig>,
    limiters: DashMap<DomainKey, Arc<RateLimiter>>,
    /// Shared by every domain beyond `max_domains`
    overflow: Arc<RateLimiter>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new(config: DomainRateLimits) -> Self {
        let overflow = Arc::new(RateLimiter::new(config.default.clone()));
        let overrides = config
            .overrides
            .iter()
            .map(|(domain, limits)| (DomainKey::new(domain), limits.clone()))
            .collect();

        Self {
            config,
            overrides,
            limiters: DashMap::new(),
            overflow,
        }
    }

    /// Get or create the limiter for a domain
    pub fn limiter_for(&self, domain: &DomainKey) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.get(domain) {
            return Arc::clone(&limiter);
        }

        let full = || self.limiters.len() >= self.config.max_domains;
        if full() {
            self.prune_idle();
        }

        if full() {
            tracing::debug!(%domain, "Per-domain limiter table full, using shared limiter");
            return Arc::clone(&self.overflow);
        }

        Arc::clone(&self.limiters.entry(domain.clone()).or_insert_with(|| {
            let config = self
                .overrides
                .get(domain)
                .cloned()
                .unwrap_or_else(|| self.config.default.clone());
            Arc::new(RateLimiter::new(config))
        }))
    }

    /// Remove limiters that have not been used for `idle_after_secs`,
    /// returning how many were removed
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let idle_after = Duration::from_secs(self.config.idle_after_secs);
        let before = self.limiters.len();

        self.limiters.retain(|_, limiter| {
            Arc::strong_count(limiter) > 1 || limiter.idle_for(now) < idle_after
        });

        before.saturating_sub(self.limiters.len())
    }

    /// Number of individually tracked domains
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Stats for a tracked domain, `None` if it has no limiter yet
    pub fn stats(&self, domain: &DomainKey) -> Option<RateLimitStats> {
        self.limiters.get(domain).map(|limiter| limiter.stats())
    }
}
