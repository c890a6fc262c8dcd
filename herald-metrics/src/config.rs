//! Metrics configuration

use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection
    ///
    /// When disabled, recording calls find no global instance and return immediately.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// OTLP/HTTP endpoint metrics are pushed to
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Maximum number of distinct `domain` label values
    ///
    /// Domains seen after the limit is reached are reported as `other`, unless
    /// listed in `high_priority_domains`.
    #[serde(default = "default_max_domain_cardinality")]
    pub max_domain_cardinality: usize,

    /// Domains that always keep their own label
    #[serde(default)]
    pub high_priority_domains: Vec<String>,

    /// Seconds between pushes to the collector
    #[serde(default = "default_export_interval_secs")]
    pub export_interval_secs: u64,

    /// `service.name` resource attribute
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

const fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

const fn default_max_domain_cardinality() -> usize {
    1000
}

const fn default_export_interval_secs() -> u64 {
    60
}

fn default_service_name() -> String {
    "herald".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            max_domain_cardinality: default_max_domain_cardinality(),
            high_priority_domains: Vec::new(),
            export_interval_secs: default_export_interval_secs(),
            service_name: default_service_name(),
        }
    }
}
