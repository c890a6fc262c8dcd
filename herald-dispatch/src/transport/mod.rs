//! Transport configuration, live transport handles and their cache
//!
//! The engine never speaks a wire protocol itself. It resolves a
//! [`TransportConfig`] through a [`ConfigLookup`], turns it into a live
//! [`Transport`] through a [`Connector`], and keeps the result in the
//! [`TransportCache`] keyed by destination domain.

mod cache;
mod registry;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::DomainKey;
use serde::{Deserialize, Serialize};

pub use cache::{CacheConfig, CacheStats, CachedTransport, PreloadReport, TransportCache};
pub use registry::{LayeredLookup, StaticTransports};

use crate::error::{ConfigLookupError, TransportError};

/// Wire protocol a transport speaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Smtp,
    Smtps,
    SmtpStartTls,
}

/// Immutable description of how to reach a mail server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Name of the credential to use; the secret itself lives elsewhere
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub credential: Option<String>,

    #[serde(default)]
    pub protocol: Protocol,

    /// Connection timeout in seconds
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[serde(default = "defaults::io_timeout")]
    pub read_timeout: u64,

    /// Write timeout in seconds
    #[serde(default = "defaults::io_timeout")]
    pub write_timeout: u64,

    pub from_address: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: defaults::port(),
            credential: None,
            protocol: Protocol::default(),
            connect_timeout: defaults::connect_timeout(),
            read_timeout: defaults::io_timeout(),
            write_timeout: defaults::io_timeout(),
            from_address: String::from("noreply@localhost"),
            display_name: None,
        }
    }
}

impl TransportConfig {
    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The `From` mailbox, with display name when configured
    #[must_use]
    pub fn sender(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => format!("{name} <{}>", self.from_address),
            _ => self.from_address.clone(),
        }
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Check the configuration is usable for `domain`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigLookupError::Invalid`] naming the first problem found.
    pub fn validate(&self, domain: &DomainKey) -> Result<(), ConfigLookupError> {
        let invalid = |reason: &str| {
            Err(ConfigLookupError::Invalid {
                domain: domain.clone(),
                reason: reason.to_string(),
            })
        };

        if self.host.trim().is_empty() {
            return invalid("host is empty");
        }
        if self.port == 0 {
            return invalid("port is zero");
        }
        if !self.from_address.contains('@') {
            return invalid("from_address is not a mailbox");
        }

        Ok(())
    }
}

mod defaults {
    pub const fn port() -> u16 {
        25
    }

    pub const fn connect_timeout() -> u64 {
        10
    }

    pub const fn io_timeout() -> u64 {
        30
    }
}

/// A rendered message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A live, reusable handle capable of delivering messages
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver a single message
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing the protocol-level failure.
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Builds live transports from configuration
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the handle cannot be built.
    async fn connect(&self, config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Source of per-domain transport configuration
#[async_trait]
pub trait ConfigLookup: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ConfigLookupError::NotFound`] when the source has nothing for
    /// `domain`, or another variant when the source itself failed.
    async fn resolve(&self, domain: &DomainKey) -> Result<TransportConfig, ConfigLookupError>;
}
