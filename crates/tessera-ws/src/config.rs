//! WebSocket configuration.
//!
//! [`WebSocketConfig`] applies to every connection of an endpoint and
//! [`ManagerConfig`] to the endpoint's [`ConnectionManager`]. Both embed
//! directly in file configuration; durations are written in milliseconds.
//!
//! [`ConnectionManager`]: crate::manager::ConnectionManager

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionMethod;
use crate::message::TextEncoding;

/// Default maximum message size (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default outbound fragment size (16 KiB).
pub const DEFAULT_FRAGMENT_SIZE: usize = 16 * 1024;

/// Default keep-alive ping interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default wait for the peer's Close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for a Pong.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on writing one outbound message.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of events queued for a connection's handler.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

/// Default watchdog period.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Which connection implementation serves an accepted socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The built-in frame engine.
    #[default]
    Native,
    /// `tokio-tungstenite`; no compression, frame events are per message.
    Tungstenite,
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes; 0 means unbounded (default: 64 MiB).
    pub max_message_size: usize,
    /// Outbound messages larger than this are fragmented (default: 16 KiB).
    pub fragment_size: usize,
    /// Interval between keep-alive pings; zero disables (default: 30 seconds).
    #[serde(rename = "keep_alive_interval_ms", with = "duration_ms")]
    pub keep_alive_interval: Duration,
    /// Wait for the peer's Close frame after sending ours (default: 1 second).
    #[serde(rename = "close_timeout_ms", with = "duration_ms")]
    pub close_timeout: Duration,
    /// Wait for a Pong after sending a Ping (default: 1 second).
    #[serde(rename = "ping_timeout_ms", with = "duration_ms")]
    pub ping_timeout: Duration,
    /// Longest a data message may take to reach the socket; zero disables
    /// (default: 10 seconds). Control frames are bounded by `close_timeout`.
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Events queued for the handler before the receive loop stops
    /// reading (default: 64).
    pub event_queue_capacity: usize,
    /// Encoding of Text payloads (default: UTF-8).
    pub text_encoding: TextEncoding,
    /// Compression offered to clients (default: none).
    pub compression: CompressionMethod,
    /// Deliver received Pings to the message callback (default: false).
    pub emit_ping_messages: bool,
    /// Connection implementation (default: native).
    pub engine: EngineKind,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            text_encoding: TextEncoding::Utf8,
            compression: CompressionMethod::None,
            emit_ping_messages: false,
            engine: EngineKind::Native,
        }
    }
}

impl WebSocketConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the outbound fragment size.
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Set the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the close handshake timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the ping timeout.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the data write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the handler event queue capacity.
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the text encoding.
    pub fn text_encoding(mut self, encoding: TextEncoding) -> Self {
        self.text_encoding = encoding;
        self
    }

    /// Set the compression method.
    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    /// Set whether Pings reach the message callback.
    pub fn emit_ping_messages(mut self, emit: bool) -> Self {
        self.emit_ping_messages = emit;
        self
    }

    /// Set the connection implementation.
    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Frame payload limit handed to the codec; 0 means unbounded.
    pub(crate) fn max_frame_payload(&self) -> u64 {
        self.max_message_size as u64
    }
}

/// Per-endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Periodically purge connections that are no longer open (default: true).
    pub watchdog_enabled: bool,
    /// Watchdog period (default: 30 seconds).
    #[serde(rename = "watchdog_interval_ms", with = "duration_ms")]
    pub watchdog_interval: Duration,
    /// Subprotocols accepted by the endpoint, in preference order.
    pub protocols: Vec<String>,
    /// Settings applied to each accepted connection.
    pub websocket: WebSocketConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watchdog_enabled: true,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            protocols: Vec::new(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the watchdog.
    pub fn watchdog_enabled(mut self, enabled: bool) -> Self {
        self.watchdog_enabled = enabled;
        self
    }

    /// Set the watchdog period.
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Add a subprotocol. Names are validated when the manager is built.
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocols.push(name.into());
        self
    }

    /// Set the per-connection settings.
    pub fn websocket(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024 * 1024);
        assert_eq!(config.fragment_size, 16 * 1024);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(config.ping_timeout, Duration::from_secs(1));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.event_queue_capacity, 64);
        assert_eq!(config.text_encoding, TextEncoding::Utf8);
        assert_eq!(config.compression, CompressionMethod::None);
        assert!(!config.emit_ping_messages);
        assert_eq!(config.engine, EngineKind::Native);
    }

    #[test]
    fn test_websocket_config_builder() {
        let config = WebSocketConfig::new()
            .max_message_size(1024)
            .fragment_size(256)
            .keep_alive_interval(Duration::ZERO)
            .close_timeout(Duration::from_millis(200))
            .compression(CompressionMethod::Deflate)
            .emit_ping_messages(true)
            .engine(EngineKind::Tungstenite);

        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.fragment_size, 256);
        assert!(config.keep_alive_interval.is_zero());
        assert_eq!(config.close_timeout, Duration::from_millis(200));
        assert_eq!(config.compression, CompressionMethod::Deflate);
        assert!(config.emit_ping_messages);
        assert_eq!(config.engine, EngineKind::Tungstenite);
    }

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert!(config.watchdog_enabled);
        assert_eq!(config.watchdog_interval, Duration::from_secs(30));
        assert!(config.protocols.is_empty());
    }

    #[test]
    fn test_manager_config_from_json() {
        let config: ManagerConfig = serde_json::from_str(
            r#"{
                "watchdog_interval_ms": 500,
                "protocols": ["chat", "echo"],
                "websocket": {
                    "close_timeout_ms": 250,
                    "write_timeout_ms": 0,
                    "event_queue_capacity": 8,
                    "compression": "deflate"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.watchdog_interval, Duration::from_millis(500));
        assert_eq!(config.protocols, vec!["chat", "echo"]);
        assert_eq!(config.websocket.close_timeout, Duration::from_millis(250));
        assert!(config.websocket.write_timeout.is_zero());
        assert_eq!(config.websocket.event_queue_capacity, 8);
        assert_eq!(config.websocket.compression, CompressionMethod::Deflate);
        assert_eq!(config.websocket.fragment_size, DEFAULT_FRAGMENT_SIZE);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<WebSocketConfig, _> = serde_json::from_str(r#"{"heartbeat": 5}"#);
        assert!(result.is_err());
    }
}
