//! # Tessera Server
//!
//! Embeddable HTTP/1.1 host for Tessera WebSocket endpoints.
//!
//! - hyper connections with upgrades enabled
//! - `GET /health` liveness and `GET /metrics` Prometheus exposition
//! - Graceful shutdown: endpoints send `1001`, in-flight HTTP connections
//!   drain up to a timeout
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_server::Server;
//! use tessera_ws::{handler_fn, ConnectionManager, ManagerConfig, WebSocketRoutes};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut routes = WebSocketRoutes::new();
//!     routes.register("/echo", |path| {
//!         let echo = handler_fn(|_manager, ctx, payload, info| async move {
//!             ctx.send(payload, info.kind).await?;
//!             Ok(())
//!         });
//!         ConnectionManager::new(path, ManagerConfig::default(), Arc::new(echo))
//!     })?;
//!
//!     Server::builder().http_addr("0.0.0.0:8080").routes(routes).build().run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod server;
pub mod shutdown;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::ServerError;
pub use health::{HealthCheck, HealthStatus};
pub use server::{HttpResponse, Server, ServerBuilder};
pub use shutdown::{os_shutdown_signal, ConnectionToken, ConnectionTracker};
pub use tessera_ws::ShutdownSignal;
