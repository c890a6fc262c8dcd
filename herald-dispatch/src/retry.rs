//! Retry with capped exponential backoff.
//!
//! [`RetryPolicy`] is plain data (attempt ceiling, initial delay, multiplier,
//! cap, jitter); [`RetryExecutor`] runs an async operation under a policy.
//! Whether an error is worth another attempt is decided by the error itself
//! through [`Retryable`], so the executor never retries indefinitely and never
//! retries a failure that cannot succeed.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{DispatchError, ErrorKind},
    interrupt::Interrupt,
};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    ///
    /// Default: 1000
    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Factor applied to the delay after every failed attempt.
    ///
    /// Default: 2.0
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,

    /// Upper bound for a single delay, in milliseconds.
    ///
    /// Default: 30000
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random spread applied to each delay (0.1 means ±10%).
    ///
    /// Default: 0.0
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            initial_delay_ms: defaults::initial_delay_ms(),
            multiplier: defaults::multiplier(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` attempts spaced by a constant `delay`
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_delay_ms: delay_ms,
            multiplier: 1.0,
            max_delay_ms: delay_ms,
            jitter_factor: 0.0,
        }
    }

    /// Check if another attempt is allowed after `attempts` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at `max_delay_ms`, then jittered.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (self.initial_delay_ms as f64) * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_factor > 0.0 && capped > 0.0 {
            let range = capped * self.jitter_factor;
            capped + rand::rng().random_range(-range..=range)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Sum of every delay this policy can impose, ignoring jitter.
    #[must_use]
    pub fn worst_case_delay(&self) -> Duration {
        let policy = Self {
            jitter_factor: 0.0,
            ..self.clone()
        };
        (1..self.max_attempts).map(|attempt| policy.delay_for(attempt)).sum()
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn initial_delay_ms() -> u64 {
        1000
    }

    pub const fn multiplier() -> f64 {
        2.0
    }

    pub const fn max_delay_ms() -> u64 {
        30_000
    }
}

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Label used for logging and backoff metrics
    fn reason(&self) -> &'static str;
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. } => true,
            Self::Transport(error) => !error.is_permanent(),
            _ => false,
        }
    }

    fn reason(&self) -> &'static str {
        match self.kind() {
            ErrorKind::RateLimitExceeded => "rate_limit",
            ErrorKind::Transport => "transport",
            other => other.as_str(),
        }
    }
}

/// A value together with the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed; `last` is the final error.
    Exhausted { attempts: u32, last: E },
    /// The operation failed with an error that is not worth retrying.
    Aborted { attempts: u32, error: E },
    /// A backoff sleep was interrupted.
    Interrupted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts, .. }
            | Self::Interrupted { attempts, .. } => *attempts,
        }
    }
}

impl From<RetryError<Self>> for DispatchError {
    fn from(error: RetryError<Self>) -> Self {
        match error {
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                source: Box::new(last),
            },
            RetryError::Aborted { error, .. } => error,
            RetryError::Interrupted { last, .. } => {
                Self::Interrupted(format!("backoff abandoned after: {last}"))
            }
        }
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    interrupt: Interrupt,
}

impl RetryExecutor {
    #[must_use]
    pub const fn new(policy: RetryPolicy, interrupt: Interrupt) -> Self {
        Self { policy, interrupt }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` with an explicit attempt ceiling and initial delay,
    /// keeping the rest of this executor's policy.
    ///
    /// # Errors
    ///
    /// See [`RetryExecutor::run`].
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        max_attempts: u32,
        initial_delay: Duration,
        operation: F,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        #[allow(clippy::cast_possible_truncation)]
        let policy = RetryPolicy {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..self.policy.clone()
        };

        Self::new(policy, self.interrupt.clone())
            .run(operation)
            .await
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// The operation receives the 1-indexed attempt number.
    ///
    /// # Errors
    ///
    /// - [`RetryError::Aborted`] for a non-retryable error
    /// - [`RetryError::Exhausted`] once `max_attempts` attempts have failed
    /// - [`RetryError::Interrupted`] if a backoff sleep was interrupted
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!(attempt, error = %error, "Not retrying");
                return Err(RetryError::Aborted {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    reason = error.reason(),
                    error = %error,
                    "Giving up after final attempt"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.delay_for(attempt);
            debug!(
                attempt,
                reason = error.reason(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Backing off before retry"
            );

            if let Some(metrics) = herald_metrics::try_metrics() {
                metrics
                    .dispatch
                    .record_backoff(error.reason(), delay.as_secs_f64());
            }

            if self.interrupt.sleep(delay).await.is_err() {
                return Err(RetryError::Interrupted {
                    attempts: attempt,
                    last: error,
                });
            }
        }
    }
}
