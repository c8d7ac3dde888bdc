//! Configuration sections owned by this crate.
//!
//! The WebSocket and telemetry sections reuse the types of the crates that
//! consume them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP listener section.
///
/// ```
/// use tessera_config::ServerSection;
///
/// let server = ServerSection::default();
/// assert_eq!(server.http_addr, "0.0.0.0:8080");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Bind address, e.g. `0.0.0.0:8080`.
    pub http_addr: String,

    /// Graceful shutdown budget in seconds.
    pub shutdown_timeout_secs: u64,

    /// Path of the echo endpoint served by `tessera-echo`.
    pub endpoint_path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            shutdown_timeout_secs: 30,
            endpoint_path: "/ws".to_string(),
        }
    }
}

impl ServerSection {
    /// Shutdown budget as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_section_partial_toml() {
        let server: ServerSection = toml::from_str("http_addr = \"127.0.0.1:9000\"").unwrap();
        assert_eq!(server.http_addr, "127.0.0.1:9000");
        assert_eq!(server.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(server.endpoint_path, "/ws");
    }

    #[test]
    fn test_server_section_rejects_unknown_fields() {
        let result: Result<ServerSection, _> = toml::from_str("port = 8080");
        assert!(result.is_err());
    }
}
