//! Orchestration of a single send
//!
//! ```text
//! Init → SlotAcquired ⟲ (rate-limit retry) → RateTokenAcquired → Rendered
//!      → TransportReady → Sent
//!
//! any non-terminal state → Failed(kind)
//! ```
//!
//! [`Dispatcher::send`] validates the request on the calling task and hands the
//! rest to the worker pool, returning a [`SendHandle`] that always resolves to
//! a [`SendResult`]. Failures never cross the async boundary as errors.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{FutureExt, future::Ready};
use herald_common::{DomainKey, internal, outgoing};
use herald_tracing::traced;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    config::DispatchConfig,
    error::{DispatchError, ErrorKind, LimitScope},
    gate::ConcurrencyGate,
    interrupt::Interrupt,
    pool::{Task, WorkerPool},
    rate_limiter::{RateLimiter, RateLimiterRegistry},
    render::{DefaultVariables, Renderer, Variables},
    retry::{RetryError, RetryExecutor, RetryPolicy},
    transport::{CachedTransport, OutboundMessage, TransportCache},
};

/// Retry ceiling for rate-limit refusals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRetry {
    /// Retries after the first refused attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RateLimitRetry {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

const fn default_max_retries() -> u32 {
    10
}

const fn default_retry_delay_ms() -> u64 {
    100
}

impl RateLimitRetry {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.max_retries.saturating_add(1),
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

/// A logical "send this template to this recipient" request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub variables: Variables,
}

impl SendRequest {
    #[must_use]
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            template: template.into(),
            variables: Variables::new(),
        }
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables.extend(variables);
        self
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] if the recipient or template is blank.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.recipient.trim().is_empty() {
            return Err(DispatchError::Validation(
                "recipient address is empty".to_string(),
            ));
        }

        if self.template.trim().is_empty() {
            return Err(DispatchError::Validation("template is empty".to_string()));
        }

        Ok(())
    }
}

/// Terminal outcome of one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub recipient: String,
    pub success: bool,
    pub message: String,
    /// Set on failure
    pub kind: Option<ErrorKind>,
    /// Transport attempts made
    pub attempts: u32,
}

impl SendResult {
    #[must_use]
    pub fn sent(recipient: impl Into<String>, attempts: u32) -> Self {
        let recipient = recipient.into();
        Self {
            message: format!("Sent to {recipient}"),
            recipient,
            success: true,
            kind: None,
            attempts,
        }
    }

    #[must_use]
    pub fn failed(recipient: impl Into<String>, error: &DispatchError, attempts: u32) -> Self {
        Self {
            recipient: recipient.into(),
            success: false,
            message: error.to_string(),
            kind: Some(error.kind()),
            attempts,
        }
    }
}

/// Where a send currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Init,
    SlotAcquired,
    RateTokenAcquired,
    Rendered,
    TransportReady,
    Sent,
    Failed(ErrorKind),
}

impl DispatchState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed(_))
    }

    /// Whether `self → next` is a legal transition
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Sent | Self::Failed(_), _) => false,
            (_, Self::Failed(_))
            | (Self::Init | Self::SlotAcquired, Self::SlotAcquired)
            | (Self::SlotAcquired, Self::RateTokenAcquired)
            | (Self::RateTokenAcquired, Self::Rendered)
            | (Self::Rendered, Self::TransportReady)
            | (Self::TransportReady, Self::Sent) => true,
            _ => false,
        }
    }

    /// Label used for the attempt metric of the stage entered from this state
    const fn stage(self) -> &'static str {
        match self {
            Self::Init => "slot",
            Self::SlotAcquired => "rate_limit",
            Self::RateTokenAcquired => "render",
            Self::Rendered => "transport_lookup",
            Self::TransportReady => "send",
            Self::Sent => "sent",
            Self::Failed(_) => "failed",
        }
    }
}

/// Per-send state tracking
#[derive(Debug)]
struct Progress<'a> {
    domain: &'a DomainKey,
    state: DispatchState,
    rate_retries: u32,
    attempts: u32,
}

impl<'a> Progress<'a> {
    const fn new(domain: &'a DomainKey) -> Self {
        Self {
            domain,
            state: DispatchState::Init,
            rate_retries: 0,
            attempts: 0,
        }
    }

    fn enter_stage(&self) {
        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics
                .dispatch
                .record_attempt(self.state.stage(), self.domain.as_str());
        }
    }

    fn advance(&mut self, next: DispatchState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal dispatch transition {:?} -> {next:?}",
            self.state
        );
        tracing::trace!(
            domain = %self.domain,
            from = ?self.state,
            to = ?next,
            rate_retries = self.rate_retries,
            "Dispatch state"
        );
        self.state = next;
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    by_kind: [AtomicU64; ErrorKind::ALL.len()],
}

/// Cumulative dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    failures_by_kind: [u64; ErrorKind::ALL.len()],
}

impl DispatchStats {
    #[must_use]
    pub const fn failures(&self, kind: ErrorKind) -> u64 {
        self.failures_by_kind[kind.index()]
    }
}

struct Inner {
    gate: ConcurrencyGate,
    gate_timeout: Duration,
    global_limit: RateLimiter,
    domain_limits: RateLimiterRegistry,
    rate_retry: RetryExecutor,
    transport_retry: RetryExecutor,
    cache: TransportCache,
    renderer: Arc<dyn Renderer>,
    defaults: DefaultVariables,
    pool: WorkerPool,
    interrupt: Interrupt,
    counters: Counters,
}

/// Single-recipient dispatch, shared across all call sites
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gate", &self.inner.gate)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: &DispatchConfig,
        cache: TransportCache,
        renderer: Arc<dyn Renderer>,
        pool: WorkerPool,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: ConcurrencyGate::new(config.gate.permits),
                gate_timeout: config.gate.acquire_timeout(),
                global_limit: RateLimiter::new(config.rate_limit.clone()),
                domain_limits: RateLimiterRegistry::new(config.domain_rate_limits.clone()),
                rate_retry: RetryExecutor::new(config.rate_limit_retry.policy(), interrupt.clone()),
                transport_retry: RetryExecutor::new(config.retry.clone(), interrupt.clone()),
                cache,
                renderer,
                defaults: config.defaults.clone(),
                pool,
                interrupt,
                counters: Counters::default(),
            }),
        }
    }

    /// Submit a send
    ///
    /// Only validation happens on the calling task. An invalid request resolves
    /// immediately to a failed result without taking a slot or a token.
    pub fn send(&self, request: SendRequest) -> SendHandle {
        if let Err(error) = request.validate() {
            let result = self.inner.finish(
                &request.recipient,
                &DomainKey::default_key(),
                Err(error),
                0,
                None,
            );
            return SendHandle::Ready(futures_util::future::ready(result));
        }

        let recipient = request.recipient.clone();
        let inner = Arc::clone(&self.inner);
        SendHandle::Pending {
            recipient,
            task: self.inner.pool.submit(inner.dispatch(request)),
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        let counters = &self.inner.counters;
        DispatchStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            failures_by_kind: std::array::from_fn(|index| {
                counters.by_kind[index].load(Ordering::Relaxed)
            }),
        }
    }

    #[must_use]
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    #[must_use]
    pub fn cache(&self) -> &TransportCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn global_limit(&self) -> &RateLimiter {
        &self.inner.global_limit
    }

    #[must_use]
    pub fn domain_limits(&self) -> &RateLimiterRegistry {
        &self.inner.domain_limits
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn interrupt(&self) -> &Interrupt {
        &self.inner.interrupt
    }
}

impl Inner {
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(recipient = %request.recipient)), timing(precision = "ms"))]
    async fn dispatch(self: Arc<Self>, request: SendRequest) -> SendResult {
        let started = Instant::now();
        let domain = DomainKey::from_address(&request.recipient);
        let mut progress = Progress::new(&domain);

        let outcome = self.execute(&request, &mut progress).await;
        let attempts = progress.attempts;
        let result = self.finish(&request.recipient, &domain, outcome, attempts, Some(started));

        if result.success {
            progress.advance(DispatchState::Sent);
        } else if let Some(kind) = result.kind {
            progress.advance(DispatchState::Failed(kind));
        }

        result
    }

    async fn execute(
        &self,
        request: &SendRequest,
        progress: &mut Progress<'_>,
    ) -> Result<(), DispatchError> {
        progress.enter_stage();
        let _slot = self.gate.acquire(self.gate_timeout, &self.interrupt).await?;
        progress.advance(DispatchState::SlotAcquired);

        progress.enter_stage();
        progress.rate_retries = self.acquire_rate_tokens(progress.domain).await?;
        progress.advance(DispatchState::RateTokenAcquired);

        progress.enter_stage();
        let variables = self.defaults.merge(&request.variables);
        let body = self.renderer.render(&request.template, &variables)?;
        progress.advance(DispatchState::Rendered);

        progress.enter_stage();
        let cached = self.cache.get(progress.domain).await?;
        progress.advance(DispatchState::TransportReady);

        progress.enter_stage();
        let message = OutboundMessage {
            from: cached.config.sender(),
            to: request.recipient.trim().to_string(),
            subject: request.subject.clone(),
            body,
        };
        let delivered = self.deliver(&cached, &message).await;
        progress.attempts = match &delivered {
            Ok(attempts) => *attempts,
            Err((_, attempts)) => *attempts,
        };

        delivered.map(|_| ()).map_err(|(error, _)| error)
    }

    /// Take the per-domain token, then the global one, retrying refusals
    ///
    /// Returns the number of retries it took.
    async fn acquire_rate_tokens(&self, domain: &DomainKey) -> Result<u32, DispatchError> {
        let domain_limit = self.domain_limits.limiter_for(domain);
        let have_domain_token = AtomicBool::new(false);

        let acquired = self
            .rate_retry
            .run(|_| {
                let domain_limit = &domain_limit;
                let have_domain_token = &have_domain_token;
                async move {
                    if !have_domain_token.load(Ordering::Acquire) {
                        if !domain_limit.acquire(&self.interrupt).await? {
                            return Err(self.refused(LimitScope::Domain));
                        }
                        have_domain_token.store(true, Ordering::Release);
                    }

                    if !self.global_limit.acquire(&self.interrupt).await? {
                        return Err(self.refused(LimitScope::Global));
                    }

                    Ok::<(), DispatchError>(())
                }
            })
            .await;

        match acquired {
            Ok(attempted) => Ok(attempted.attempts - 1),
            Err(RetryError::Exhausted { attempts, last }) => Err(match last {
                DispatchError::RateLimitExceeded { scope, .. } => DispatchError::RateLimitExceeded {
                    scope,
                    retries: attempts - 1,
                },
                other => other,
            }),
            Err(other) => Err(other.into()),
        }
    }

    fn refused(&self, scope: LimitScope) -> DispatchError {
        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.dispatch.record_rate_limited(scope.as_str());
        }

        DispatchError::RateLimitExceeded { scope, retries: 0 }
    }

    /// Send through the transport with retry, returning the attempts made
    async fn deliver(
        &self,
        cached: &CachedTransport,
        message: &OutboundMessage,
    ) -> Result<u32, (DispatchError, u32)> {
        let result = self
            .transport_retry
            .run(|attempt| {
                let transport = &cached.transport;
                async move {
                    outgoing!("Sending to {} (attempt {attempt})", message.to);
                    transport.send(message).await.map_err(DispatchError::from)
                }
            })
            .await;

        match result {
            Ok(attempted) => Ok(attempted.attempts),
            Err(error) => {
                let attempts = error.attempts();
                Err((error.into(), attempts))
            }
        }
    }

    fn finish(
        &self,
        recipient: &str,
        domain: &DomainKey,
        outcome: Result<(), DispatchError>,
        attempts: u32,
        started: Option<Instant>,
    ) -> SendResult {
        let counters = &self.counters;
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(()) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = herald_metrics::try_metrics() {
                    let elapsed = started.map_or(0.0, |started| started.elapsed().as_secs_f64());
                    metrics
                        .dispatch
                        .record_success(domain.as_str(), elapsed, u64::from(attempts));
                }
                internal!(level = INFO, "Sent to {recipient} ({domain}) in {attempts} attempt(s)");

                SendResult::sent(recipient, attempts)
            }
            Err(error) => {
                let kind = error.kind();
                counters.failed.fetch_add(1, Ordering::Relaxed);
                counters.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = herald_metrics::try_metrics() {
                    metrics.dispatch.record_failure(kind.as_str(), domain.as_str());
                }
                tracing::warn!(%recipient, %domain, %kind, %error, "Send failed");

                SendResult::failed(recipient, &error, attempts)
            }
        }
    }
}

/// Resolves to the [`SendResult`] of a submitted send
#[derive(Debug)]
pub enum SendHandle {
    /// Already decided on submission
    Ready(Ready<SendResult>),
    /// Running, or waiting to be run by whoever awaits this handle
    Pending {
        recipient: String,
        task: Task<SendResult>,
    },
}

impl SendHandle {
    /// Whether the result was decided on submission
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Stop waiting for the result; the send itself carries on
    pub fn detach(self) {
        if let Self::Pending { task, .. } = self {
            task.detach();
        }
    }
}

impl Future for SendHandle {
    type Output = SendResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Self::Ready(ready) => ready.poll_unpin(cx),
            Self::Pending { recipient, task } => task.poll_unpin(cx).map(|joined| {
                joined.unwrap_or_else(|error| {
                    let error = DispatchError::Interrupted(format!("dispatch task lost: {error}"));
                    SendResult::failed(recipient.clone(), &error, 0)
                })
            }),
        }
    }
}
