//! WebSocket metrics.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed with [`init_metrics`].
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tessera_ws_connections_opened_total` | Counter | `path` |
//! | `tessera_ws_connections_closed_total` | Counter | `path`, `code` |
//! | `tessera_ws_active_connections` | Gauge | `path` |
//! | `tessera_ws_messages_received_total` | Counter | `path`, `kind` |
//! | `tessera_ws_messages_sent_total` | Counter | `path`, `kind` |
//! | `tessera_ws_message_size_bytes` | Histogram | `path`, `direction` |
//! | `tessera_ws_protocol_errors_total` | Counter | `path`, `code` |
//! | `tessera_ws_handshakes_rejected_total` | Counter | `path`, `reason` |

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::TelemetryResult;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const CONNECTIONS_OPENED: &str = "tessera_ws_connections_opened_total";
const CONNECTIONS_CLOSED: &str = "tessera_ws_connections_closed_total";
const ACTIVE_CONNECTIONS: &str = "tessera_ws_active_connections";
const MESSAGES_RECEIVED: &str = "tessera_ws_messages_received_total";
const MESSAGES_SENT: &str = "tessera_ws_messages_sent_total";
const MESSAGE_SIZE: &str = "tessera_ws_message_size_bytes";
const PROTOCOL_ERRORS: &str = "tessera_ws_protocol_errors_total";
const HANDSHAKES_REJECTED: &str = "tessera_ws_handshakes_rejected_total";

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder.
    pub enabled: bool,

    /// Buckets for the message size histogram, in bytes.
    pub size_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size_buckets: vec![
                64.0, 256.0, 1024.0, 4096.0, 16_384.0, 65_536.0, 262_144.0, 1_048_576.0,
            ],
        }
    }
}

/// Install the Prometheus recorder.
///
/// The rendered exposition is available from [`render_metrics`]; serving
/// it is left to the host server.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(MESSAGE_SIZE.to_string()),
            &config.size_buckets,
        )
        .map_err(|e| TelemetryError::InvalidConfig(e.to_string()))?
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let _ = METRICS_HANDLE.set(handle);
    describe_metrics();
    Ok(())
}

/// Prometheus text exposition, or `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn describe_metrics() {
    describe_counter!(CONNECTIONS_OPENED, "WebSocket connections accepted");
    describe_counter!(CONNECTIONS_CLOSED, "WebSocket connections removed, by close code");
    describe_gauge!(ACTIVE_CONNECTIONS, "WebSocket connections currently registered");
    describe_counter!(MESSAGES_RECEIVED, "Complete messages received");
    describe_counter!(MESSAGES_SENT, "Messages sent");
    describe_histogram!(MESSAGE_SIZE, "Uncompressed message size in bytes");
    describe_counter!(PROTOCOL_ERRORS, "Connections failed for a protocol violation");
    describe_counter!(HANDSHAKES_REJECTED, "Upgrade requests refused during negotiation");
}

/// A connection was registered on `path`.
pub fn record_connection_opened(path: &str) {
    counter!(CONNECTIONS_OPENED, "path" => path.to_string()).increment(1);
    gauge!(ACTIVE_CONNECTIONS, "path" => path.to_string()).increment(1.0);
}

/// A connection left the registry of `path` with close `code`.
pub fn record_connection_closed(path: &str, code: u16) {
    counter!(
        CONNECTIONS_CLOSED,
        "path" => path.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
    gauge!(ACTIVE_CONNECTIONS, "path" => path.to_string()).decrement(1.0);
}

/// A complete message of `kind` and `bytes` length arrived.
pub fn record_message_received(path: &str, kind: &'static str, bytes: usize) {
    counter!(MESSAGES_RECEIVED, "path" => path.to_string(), "kind" => kind).increment(1);
    histogram!(MESSAGE_SIZE, "path" => path.to_string(), "direction" => "received")
        .record(bytes as f64);
}

/// A message of `kind` and `bytes` length was written.
pub fn record_message_sent(path: &str, kind: &'static str, bytes: usize) {
    counter!(MESSAGES_SENT, "path" => path.to_string(), "kind" => kind).increment(1);
    histogram!(MESSAGE_SIZE, "path" => path.to_string(), "direction" => "sent")
        .record(bytes as f64);
}

/// A connection was failed with close `code`.
pub fn record_protocol_error(path: &str, code: u16) {
    counter!(
        PROTOCOL_ERRORS,
        "path" => path.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// An upgrade request was refused.
pub fn record_handshake_rejected(path: &str, reason: &'static str) {
    counter!(HANDSHAKES_REJECTED, "path" => path.to_string(), "reason" => reason).increment(1);
}
