use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metrics system already initialized")]
    AlreadyInitialized,

    #[error("Invalid metrics configuration: {0}")]
    InvalidConfig(String),

    /// Instrument or exporter construction failed inside the SDK
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),
}
