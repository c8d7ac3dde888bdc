//! Telemetry error types.

use thiserror::Error;

/// Errors raised while installing logging or metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The metrics recorder could not be installed.
    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// The tracing subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// A configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TelemetryError::MetricsInit("failed".to_string());
        assert_eq!(err.to_string(), "Failed to initialize metrics: failed");

        let err = TelemetryError::InvalidConfig("format".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: format");
    }
}
