//! Typed error handling for dispatch operations.
//!
//! Every failure a send can end in is a [`DispatchError`], and every
//! `DispatchError` maps onto exactly one [`ErrorKind`]. The kind decides the
//! retry behaviour and is the label used for failure metrics:
//!
//! - `Validation`, `ConcurrencySlotTimeout`, `TemplateRender`: never retried
//! - `RateLimitExceeded`: retried up to the rate-limit retry ceiling
//! - `Transport`: retried with exponential backoff unless the server rejected
//!   the message permanently (5xx)
//! - `ConfigLookup`: only surfaced once the default configuration also failed
//! - `Interrupted`: propagated immediately

use std::{fmt, time::Duration};

use herald_common::DomainKey;
use thiserror::Error;

/// Classification of dispatch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ConcurrencySlotTimeout,
    RateLimitExceeded,
    TemplateRender,
    ConfigLookup,
    Transport,
    Interrupted,
}

impl ErrorKind {
    pub const ALL: [Self; 7] = [
        Self::Validation,
        Self::ConcurrencySlotTimeout,
        Self::RateLimitExceeded,
        Self::TemplateRender,
        Self::ConfigLookup,
        Self::Transport,
        Self::Interrupted,
    ];

    /// Stable label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ConcurrencySlotTimeout => "concurrency_slot_timeout",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::TemplateRender => "template_render",
            Self::ConfigLookup => "config_lookup",
            Self::Transport => "transport",
            Self::Interrupted => "interrupted",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rate limiter refused a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Domain,
}

impl LimitScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Domain => "domain",
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request or configuration is malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No concurrency slot became free in time.
    #[error("No available sending slot within {0:?}")]
    SlotTimeout(Duration),

    /// A rate limiter kept refusing tokens.
    #[error("Rate limit exceeded ({scope}) after {retries} retries")]
    RateLimitExceeded { scope: LimitScope, retries: u32 },

    /// The renderer could not produce a body.
    #[error("Template render failed: {0}")]
    Render(#[from] RenderError),

    /// Neither the domain nor the default configuration could be resolved.
    #[error("Transport configuration lookup failed: {0}")]
    ConfigLookup(#[from] ConfigLookupError),

    /// The transport could not be built or refused the message.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A retried operation failed on every attempt.
    #[error("Failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DispatchError>,
    },

    /// A wait was abandoned because of shutdown, or the task was lost.
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl DispatchError {
    /// The kind used for retry decisions and metrics
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::SlotTimeout(_) => ErrorKind::ConcurrencySlotTimeout,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Render(_) => ErrorKind::TemplateRender,
            Self::ConfigLookup(_) => ErrorKind::ConfigLookup,
            Self::Transport(_) => ErrorKind::Transport,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::Interrupted(_) => ErrorKind::Interrupted,
        }
    }
}

impl From<Interrupted> for DispatchError {
    fn from(error: Interrupted) -> Self {
        Self::Interrupted(error.to_string())
    }
}

/// A wait ended because shutdown was requested
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("wait abandoned, shutdown requested")]
pub struct Interrupted;

/// Failures of the external template renderer
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Missing variable `{variable}` in template {template}")]
    MissingVariable { template: String, variable: String },

    #[error("Malformed template {template}: {reason}")]
    Malformed { template: String, reason: String },
}

/// Failures of a transport configuration source
#[derive(Debug, Error)]
pub enum ConfigLookupError {
    /// No configuration exists for the domain.
    #[error("No transport configuration for {0}")]
    NotFound(DomainKey),

    /// The configuration source could not be reached.
    #[error("Configuration source unavailable: {0}")]
    Unavailable(String),

    /// The stored configuration is unusable.
    #[error("Invalid transport configuration for {domain}: {reason}")]
    Invalid { domain: DomainKey, reason: String },
}

/// Failures of the external transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish or keep a connection.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The remote side did not answer in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote side answered with an error code.
    #[error("Rejected: {code} {message}")]
    Rejected { code: u16, message: String },

    /// The conversation broke protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// A 5xx rejection will not succeed on retry
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 500 && *code < 600)
    }
}
