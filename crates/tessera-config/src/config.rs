//! The root configuration type.

use std::collections::HashSet;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tessera_telemetry::logging::create_env_filter;
use tessera_telemetry::{LogConfig, TelemetryConfig};
use tessera_ws::handshake::is_valid_token;
use tessera_ws::{ManagerConfig, WebSocketConfig};

use crate::error::ConfigError;
use crate::schema::ServerSection;

/// Complete configuration of a Tessera server.
///
/// `[websocket]` holds the settings of every accepted connection and
/// `[manager]` the settings of each endpoint. Use
/// [`manager_config`](Self::manager_config) to combine them.
///
/// ```
/// use tessera_config::TesseraConfig;
///
/// let config = TesseraConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TesseraConfig {
    /// HTTP listener.
    pub server: ServerSection,

    /// Per-connection settings.
    pub websocket: WebSocketConfig,

    /// Per-endpoint settings.
    pub manager: ManagerConfig,

    /// Logging and metrics.
    pub telemetry: TelemetryConfig,
}

impl TesseraConfig {
    /// Debug logging in a readable format, metrics off.
    pub fn development() -> Self {
        Self {
            telemetry: TelemetryConfig::development(),
            ..Self::default()
        }
    }

    /// JSON logging at `info`, metrics on.
    pub fn production() -> Self {
        Self {
            telemetry: TelemetryConfig::default().logging(LogConfig::production()),
            ..Self::default()
        }
    }

    /// The endpoint settings with `[websocket]` applied to every connection.
    pub fn manager_config(&self) -> ManagerConfig {
        self.manager.clone().websocket(self.websocket.clone())
    }

    /// Check values that deserialization alone cannot.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.http_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "server.http_addr",
                format!("invalid socket address: {}", self.server.http_addr),
            ));
        }
        if self.server.shutdown_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "server.shutdown_timeout_secs",
                "must be positive",
            ));
        }
        if !self.server.endpoint_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "server.endpoint_path",
                "must start with '/'",
            ));
        }

        if self.websocket.fragment_size == 0 {
            return Err(ConfigError::invalid_value(
                "websocket.fragment_size",
                "must be positive",
            ));
        }
        if self.websocket.close_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "websocket.close_timeout_ms",
                "must be positive",
            ));
        }
        if self.websocket.ping_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "websocket.ping_timeout_ms",
                "must be positive",
            ));
        }
        if self.websocket.event_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "websocket.event_queue_capacity",
                "must be positive",
            ));
        }
        if self.manager.websocket != WebSocketConfig::default() {
            return Err(ConfigError::invalid_value(
                "manager.websocket",
                "set connection options in the [websocket] section",
            ));
        }

        if self.manager.watchdog_enabled && self.manager.watchdog_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "manager.watchdog_interval_ms",
                "must be positive when the watchdog is enabled",
            ));
        }
        let mut seen = HashSet::new();
        for protocol in &self.manager.protocols {
            if !is_valid_token(protocol) {
                return Err(ConfigError::invalid_value(
                    "manager.protocols",
                    format!("{protocol:?} is not a valid token"),
                ));
            }
            if !seen.insert(protocol.as_str()) {
                return Err(ConfigError::invalid_value(
                    "manager.protocols",
                    format!("{protocol:?} is listed twice"),
                ));
            }
        }

        if let Err(e) = create_env_filter(&self.telemetry.logging.level) {
            return Err(ConfigError::invalid_value("telemetry.logging.level", e.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessera_telemetry::LogFormat;

    #[test]
    fn test_default_is_valid() {
        assert!(TesseraConfig::default().validate().is_ok());
        assert!(TesseraConfig::development().validate().is_ok());
        assert!(TesseraConfig::production().validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let dev = TesseraConfig::development();
        assert_eq!(dev.telemetry.logging.format, LogFormat::Pretty);
        assert!(!dev.telemetry.metrics.enabled);

        let prod = TesseraConfig::production();
        assert_eq!(prod.telemetry.logging.format, LogFormat::Json);
        assert!(prod.telemetry.metrics.enabled);
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = TesseraConfig::default();
        config.server.http_addr = "localhost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.http_addr"));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = TesseraConfig::default();
        config.websocket.close_timeout = Duration::ZERO;
        assert!(config.validate().unwrap_err().to_string().contains("close_timeout_ms"));

        let mut config = TesseraConfig::default();
        config.server.shutdown_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = TesseraConfig::default();
        config.websocket.write_timeout = Duration::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_event_queue_rejected() {
        let mut config = TesseraConfig::default();
        config.websocket.event_queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("event_queue_capacity"));
    }

    #[test]
    fn test_zero_fragment_size_rejected() {
        let mut config = TesseraConfig::default();
        config.websocket.fragment_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("fragment_size"));
    }

    #[test]
    fn test_protocol_tokens_checked() {
        let mut config = TesseraConfig::default();
        config.manager = ManagerConfig::default().protocol("chat").protocol("chat v2");
        assert!(config.validate().unwrap_err().to_string().contains("chat v2"));

        config.manager = ManagerConfig::default().protocol("chat").protocol("chat");
        assert!(config.validate().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn test_nested_websocket_section_rejected() {
        let mut config = TesseraConfig::default();
        config.manager.websocket = WebSocketConfig::default().fragment_size(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_log_filter_rejected() {
        let mut config = TesseraConfig::default();
        config.telemetry.logging.level = "tessera_ws=loud".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("telemetry.logging.level"));
    }

    #[test]
    fn test_manager_config_applies_websocket_section() {
        let mut config = TesseraConfig::default();
        config.websocket.fragment_size = 1024;
        config.manager.protocols = vec!["chat".to_string()];
        let manager = config.manager_config();
        assert_eq!(manager.websocket.fragment_size, 1024);
        assert_eq!(manager.protocols, vec!["chat"]);
    }
}
