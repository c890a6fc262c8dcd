//! Engine configuration
//!
//! Every section can be omitted; omitted fields take the defaults documented
//! on each section type.
//!
//! ```ron
//! (
//!     cache: (max_size: 500),
//!     rate_limit: (permits_per_window: 200, window_ms: 1000),
//!     domain_rate_limits: (
//!         default: (permits_per_window: 20),
//!         overrides: { "bank.example.com": (permits_per_window: 5) },
//!     ),
//!     gate: (permits: 50, acquire_timeout_ms: 10000),
//!     retry: (max_attempts: 3, initial_delay_ms: 1000, multiplier: 2.0, max_delay_ms: 30000),
//!     batch: (batch_size: 50),
//!     defaults: (company_name: "Acme Payments"),
//!     transports: (default: (host: "smtp.internal", from_address: "noreply@acme.test")),
//! )
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    batch::BatchConfig,
    dispatcher::RateLimitRetry,
    error::DispatchError,
    gate::GateConfig,
    maintenance::MaintenanceConfig,
    pool::PoolConfig,
    rate_limiter::{DomainRateLimits, RateLimitConfig},
    render::DefaultVariables,
    retry::RetryPolicy,
    transport::{CacheConfig, StaticTransports},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    /// Global limiter shared by every send
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub domain_rate_limits: DomainRateLimits,

    #[serde(default)]
    pub gate: GateConfig,

    /// Transport send retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub rate_limit_retry: RateLimitRetry,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub defaults: DefaultVariables,

    #[serde(default)]
    pub transports: StaticTransports,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl DispatchConfig {
    /// Reject values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let checks = [
            (self.cache.max_size == 0, "cache.max_size must be at least 1"),
            (
                self.rate_limit.permits_per_window == 0,
                "rate_limit.permits_per_window must be at least 1",
            ),
            (self.rate_limit.window_ms == 0, "rate_limit.window_ms must be at least 1"),
            (
                self.domain_rate_limits.default.permits_per_window == 0,
                "domain_rate_limits.default.permits_per_window must be at least 1",
            ),
            (
                self.domain_rate_limits.default.window_ms == 0,
                "domain_rate_limits.default.window_ms must be at least 1",
            ),
            (self.gate.permits == 0, "gate.permits must be at least 1"),
            (self.retry.max_attempts == 0, "retry.max_attempts must be at least 1"),
            (self.retry.multiplier < 1.0, "retry.multiplier must be at least 1.0"),
            (
                !(0.0..=1.0).contains(&self.retry.jitter_factor),
                "retry.jitter_factor must be between 0.0 and 1.0",
            ),
            (self.batch.batch_size == 0, "batch.batch_size must be at least 1"),
        ];

        if let Some((_, reason)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(DispatchError::Validation((*reason).to_string()));
        }

        for (domain, limit) in &self.domain_rate_limits.overrides {
            if limit.permits_per_window == 0 || limit.window_ms == 0 {
                return Err(DispatchError::Validation(format!(
                    "domain_rate_limits.overrides.{domain} must allow at least one permit per non-empty window"
                )));
            }
        }

        Ok(())
    }
}
