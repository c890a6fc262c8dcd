use std::time::Duration;

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, metrics::SdkMeterProvider};

use crate::{MetricsConfig, MetricsError};

/// Meter provider pushing to the configured OTLP/HTTP endpoint every
/// `export_interval_secs`, tagged with `service_name`
pub fn init_otlp_exporter(config: &MetricsConfig) -> Result<SdkMeterProvider, MetricsError> {
    if config.endpoint.trim().is_empty() {
        return Err(MetricsError::InvalidConfig("endpoint is empty".to_string()));
    }
    if config.export_interval_secs == 0 {
        return Err(MetricsError::InvalidConfig(
            "export_interval_secs must be at least 1".to_string(),
        ));
    }

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(config.endpoint.as_str())
        .build()
        .map_err(|e| MetricsError::OpenTelemetry(e.to_string()))?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(config.export_interval_secs))
        .build();

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}
