//! Configuration sources for transports
//!
//! [`StaticTransports`] is the registry read from the configuration file:
//!
//! ```ron
//! transports: (
//!     default: (host: "smtp.internal", port: 587, from_address: "noreply@vendor.test"),
//!     domains: {
//!         "bank.example.com": (
//!             host: "relay.bank.example.com",
//!             protocol: Smtps,
//!             port: 465,
//!             from_address: "payments@vendor.test",
//!         ),
//!     },
//! )
//! ```
//!
//! [`LayeredLookup`] puts another source (typically a database adapter) in
//! front of it.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use herald_common::DomainKey;
use serde::{Deserialize, Serialize};

use super::{ConfigLookup, TransportConfig};
use crate::error::ConfigLookupError;

/// Registry of per-domain transport configurations with a mandatory default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticTransports {
    /// Used for the `"default"` key
    #[serde(default)]
    pub default: TransportConfig,

    /// Per-domain configuration
    #[serde(default)]
    pub domains: HashMap<String, TransportConfig>,
}

impl StaticTransports {
    #[must_use]
    pub fn new(default: TransportConfig) -> Self {
        Self {
            default,
            domains: HashMap::new(),
        }
    }

    /// Add or replace the configuration for a domain
    pub fn insert(&mut self, domain: &str, config: TransportConfig) {
        self.domains
            .insert(DomainKey::new(domain).as_str().to_string(), config);
    }

    /// Builder-style [`StaticTransports::insert`]
    #[must_use]
    pub fn with_domain(mut self, domain: &str, config: TransportConfig) -> Self {
        self.insert(domain, config);
        self
    }

    /// Get configuration for a specific domain, ignoring case
    #[must_use]
    pub fn get(&self, domain: &DomainKey) -> Option<&TransportConfig> {
        if domain.is_default() {
            return Some(&self.default);
        }

        self.domains.get(domain.as_str()).or_else(|| {
            self.domains
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(domain.as_str()))
                .map(|(_, config)| config)
        })
    }

    /// Number of configured domains, excluding the default
    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[async_trait]
impl ConfigLookup for StaticTransports {
    async fn resolve(&self, domain: &DomainKey) -> Result<TransportConfig, ConfigLookupError> {
        let config = self
            .get(domain)
            .ok_or_else(|| ConfigLookupError::NotFound(domain.clone()))?;
        config.validate(domain)?;
        Ok(config.clone())
    }
}

/// A primary source that falls back to a secondary one on any error
#[derive(Clone)]
pub struct LayeredLookup {
    primary: Arc<dyn ConfigLookup>,
    fallback: Arc<dyn ConfigLookup>,
}

impl LayeredLookup {
    #[must_use]
    pub fn new(primary: Arc<dyn ConfigLookup>, fallback: Arc<dyn ConfigLookup>) -> Self {
        Self { primary, fallback }
    }
}

impl std::fmt::Debug for LayeredLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredLookup").finish_non_exhaustive()
    }
}

#[async_trait]
impl ConfigLookup for LayeredLookup {
    async fn resolve(&self, domain: &DomainKey) -> Result<TransportConfig, ConfigLookupError> {
        match self.primary.resolve(domain).await {
            Ok(config) => Ok(config),
            Err(error) => {
                tracing::debug!(%domain, %error, "Primary transport lookup failed, using fallback");
                self.fallback.resolve(domain).await
            }
        }
    }
}
