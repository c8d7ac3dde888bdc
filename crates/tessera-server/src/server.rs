//! The HTTP listener.
//!
//! Every accepted TCP connection is served by hyper's HTTP/1.1 connection
//! with upgrades enabled. `GET /health` and `GET /metrics` are answered
//! directly; everything else goes to the [`WebSocketRoutes`], which either
//! rejects the request or answers `101` and takes over the socket.
//!
//! ```rust,ignore
//! use tessera_server::Server;
//!
//! let server = Server::builder()
//!     .http_addr("0.0.0.0:8080")
//!     .routes(routes)
//!     .build();
//! server.run().await?;
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tessera_telemetry::render_metrics;
use tessera_ws::{ShutdownSignal, WebSocketRoutes};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ServerConfig, ServerConfigBuilder};
use crate::error::ServerError;
use crate::health::HealthCheck;
use crate::shutdown::{os_shutdown_signal, ConnectionTracker};

/// HTTP response type of the server.
pub type HttpResponse = Response<Full<Bytes>>;

/// Hosts WebSocket endpoints over HTTP/1.1.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    routes: WebSocketRoutes,
    health: HealthCheck,
}

impl Server {
    /// Creates a server with no endpoints.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: WebSocketRoutes::new(),
            health: HealthCheck::new("tessera", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Creates a server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The hosted endpoints.
    #[must_use]
    pub fn routes(&self) -> &WebSocketRoutes {
        &self.routes
    }

    /// Runs until SIGTERM or SIGINT.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(os_shutdown_signal()).await
    }

    /// Binds the configured address and runs until `shutdown` fires.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        let addr = self.config.socket_addr().map_err(|e| {
            ServerError::BindError(format!("invalid address '{}': {e}", self.config.http_addr()))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("failed to bind to {addr}: {e}")))?;

        self.run_with_listener(listener, shutdown).await
    }

    /// Serves an already bound listener until `shutdown` fires.
    ///
    /// Stops accepting, shuts every endpoint down (open WebSocket
    /// connections receive `1001`), then waits up to the shutdown timeout
    /// for in-flight HTTP connections.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: ShutdownSignal,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, endpoints = ?self.routes.paths(), "server listening");

        let server = Arc::new(self);
        let tracker = ConnectionTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        let server = Arc::clone(&server);
                        let token = tracker.acquire();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, shutdown).await {
                                tracing::debug!(remote_addr = %remote_addr, error = %e, "connection error");
                            }
                            drop(token);
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept connection");
                    }
                },
                () = shutdown.recv() => {
                    tracing::info!("shutdown signal received, stopping listener");
                    break;
                }
            }
        }
        drop(listener);

        server.routes.shutdown().await;

        let timeout = server.config.shutdown_timeout();
        if tokio::time::timeout(timeout, tracker.wait_for_drain()).await.is_err() {
            tracing::warn!(
                remaining = tracker.active_connections(),
                "shutdown timeout reached with connections still open"
            );
        }

        tracing::info!("server stopped");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        shutdown: ShutdownSignal,
    ) -> Result<(), hyper::Error> {
        let server = Arc::clone(&self);
        let service = service_fn(move |request: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { Ok::<_, Infallible>(server.handle_request(request)) }
        });

        let connection = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => result,
            () = shutdown.recv() => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        }
    }

    fn handle_request(&self, request: Request<Incoming>) -> HttpResponse {
        tracing::debug!(method = %request.method(), path = request.uri().path(), "request");

        match (request.method(), request.uri().path()) {
            (&Method::GET, "/health") => self.handle_health(),
            (&Method::GET, "/metrics") => handle_metrics(),
            _ => self.routes.handle(request),
        }
    }

    fn handle_health(&self) -> HttpResponse {
        let connections = self
            .routes
            .paths()
            .into_iter()
            .filter_map(|path| self.routes.get(path))
            .map(|manager| manager.len())
            .sum();
        let body = serde_json::to_string(&self.health.status(connections))
            .unwrap_or_else(|_| r#"{"status":"healthy"}"#.to_string());
        json_response(StatusCode::OK, body)
    }
}

fn handle_metrics() -> HttpResponse {
    match render_metrics() {
        Some(text) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(text)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
        None => json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"metrics are not enabled"}"#.to_string(),
        ),
    }
}

fn json_response(status: StatusCode, body: String) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Builder for [`Server`].
///
/// ```rust
/// use std::time::Duration;
/// use tessera_server::Server;
///
/// let server = Server::builder()
///     .http_addr("127.0.0.1:9000")
///     .shutdown_timeout(Duration::from_secs(5))
///     .build();
/// assert_eq!(server.config().http_addr(), "127.0.0.1:9000");
/// ```
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config_builder: ServerConfigBuilder,
    routes: Option<WebSocketRoutes>,
    service_name: Option<String>,
    service_version: Option<String>,
}

impl ServerBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the listener settings.
    #[must_use]
    pub fn config(mut self, config: &ServerConfig) -> Self {
        self.config_builder = ServerConfigBuilder::new()
            .http_addr(config.http_addr())
            .shutdown_timeout(config.shutdown_timeout());
        self
    }

    /// Sets the bind address.
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.http_addr(addr);
        self
    }

    /// Sets the graceful shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.shutdown_timeout(timeout);
        self
    }

    /// Sets the hosted endpoints.
    #[must_use]
    pub fn routes(mut self, routes: WebSocketRoutes) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Service name reported by `/health`.
    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Service version reported by `/health`.
    #[must_use]
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let service = self.service_name.unwrap_or_else(|| "tessera".to_string());
        let version = self
            .service_version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        Server {
            config: self.config_builder.build(),
            routes: self.routes.unwrap_or_default(),
            health: HealthCheck::new(service, version),
        }
    }
}
