//! Endpoint registration by path.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use http::{header, HeaderValue, Request, StatusCode};
use tracing::debug;

use crate::error::{WsError, WsResult};
use crate::handshake::{plain_response, HandshakeResponse, UpgradeRequest};
use crate::manager::ConnectionManager;

/// The WebSocket endpoints of a server, keyed by path.
///
/// ```rust,ignore
/// let mut routes = WebSocketRoutes::new();
/// routes.register("/chat", |path| {
///     ConnectionManager::new(path, ManagerConfig::default(), Arc::new(ChatHandler))
/// })?;
/// ```
#[derive(Debug, Default)]
pub struct WebSocketRoutes {
    managers: BTreeMap<String, Arc<ConnectionManager>>,
}

impl WebSocketRoutes {
    /// No endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the endpoint at `path`, built by `build` from the normalised path.
    pub fn register<F>(&mut self, path: &str, build: F) -> WsResult<Arc<ConnectionManager>>
    where
        F: FnOnce(&str) -> WsResult<Arc<ConnectionManager>>,
    {
        let path = normalize_path(path);
        if self.managers.contains_key(&path) {
            return Err(WsError::DuplicateEndpoint(path));
        }

        let manager = build(&path)?;
        debug!(path = %path, "websocket endpoint registered");
        self.managers.insert(path, Arc::clone(&manager));
        Ok(manager)
    }

    /// The manager for `path`.
    pub fn get(&self, path: &str) -> Option<&Arc<ConnectionManager>> {
        self.managers.get(&normalize_path(path))
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        self.managers.keys().map(String::as_str).collect()
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    /// Whether no endpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Route an HTTP request.
    ///
    /// Unknown paths get `404`, plain HTTP requests to an endpoint get
    /// `426 Upgrade Required`, and upgrades go to the endpoint's manager.
    pub fn handle<B>(&self, request: Request<B>) -> HandshakeResponse {
        let Some(manager) = self.managers.get(request.uri().path()) else {
            return plain_response(StatusCode::NOT_FOUND, "no websocket endpoint at this path");
        };

        if !UpgradeRequest::from_request(&request).is_upgrade() {
            let mut response =
                plain_response(StatusCode::UPGRADE_REQUIRED, "this endpoint requires a websocket upgrade");
            response
                .headers_mut()
                .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
            return response;
        }

        manager.upgrade(request)
    }

    /// Shut down every endpoint.
    pub async fn shutdown(&self) {
        join_all(self.managers.values().map(|manager| manager.shutdown())).await;
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
