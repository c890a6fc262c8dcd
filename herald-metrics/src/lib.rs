//! OpenTelemetry metrics for herald
//!
//! Instruments are pushed over OTLP/HTTP to an OpenTelemetry Collector.
//!
//! ```text
//! herald → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! Recording is fire-and-forget: components call [`try_metrics`] and skip
//! recording when metrics were never initialised, so a missing or disabled
//! exporter can never fail or block a send.
//!
//! ```rust,no_run
//! use herald_metrics::{init_metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_metrics(&MetricsConfig::default())?;
//!
//! if let Some(metrics) = herald_metrics::try_metrics() {
//!     metrics.cache.record_hit();
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod dispatch;
mod error;
mod exporter;
mod labels;

pub use cache::CacheMetrics;
pub use config::MetricsConfig;
pub use dispatch::DispatchMetrics;
pub use error::MetricsError;
pub use labels::{DomainLabels, OTHER_DOMAIN};
use once_cell::sync::OnceCell;

static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub dispatch: DispatchMetrics,
    pub cache: CacheMetrics,
}

/// Initialize the metrics system
///
/// Must be called at most once, before any metrics are recorded. If metrics
/// are disabled in the config this is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(config)?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        dispatch: DispatchMetrics::new(
            config.max_domain_cardinality,
            config.high_priority_domains.clone(),
        )?,
        cache: CacheMetrics::new()?,
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if metrics were initialised
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
