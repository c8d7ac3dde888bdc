//! The `/health` liveness endpoint.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Body of a `/health` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    /// Always `healthy` while the server answers.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Seconds since the server was built.
    pub uptime_seconds: u64,
    /// Open WebSocket connections across all endpoints.
    pub websocket_connections: usize,
}

/// Source of [`HealthStatus`] values.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    service: String,
    version: String,
    started_at: Instant,
}

impl HealthCheck {
    /// Starts the uptime clock.
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            started_at: Instant::now(),
        }
    }

    /// Current status, given the live connection count.
    pub fn status(&self, websocket_connections: usize) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            service: self.service.clone(),
            version: self.version.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            websocket_connections,
        }
    }
}
