//! Telemetry configuration.

use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;
use crate::metrics::MetricsConfig;

/// Configuration for logging and metrics together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Logging configuration.
    pub logging: LogConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl TelemetryConfig {
    /// Development logging, metrics off.
    pub fn development() -> Self {
        Self {
            logging: LogConfig::development(),
            metrics: MetricsConfig {
                enabled: false,
                ..MetricsConfig::default()
            },
        }
    }

    /// Replace the logging section.
    pub fn logging(mut self, logging: LogConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Replace the metrics section.
    pub fn metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }
}
