//! Typed configuration for Tessera servers.
//!
//! - TOML and JSON files
//! - Layering: preset, then files, then environment variables
//! - Strict parsing: unknown fields are errors
//! - Validation of values serde cannot check
//!
//! # Example
//!
//! ```no_run
//! use tessera_config::ConfigLoader;
//!
//! # fn main() -> Result<(), tessera_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_dotenv()?
//!     .with_optional_file("tessera.toml")?
//!     .with_env_prefix("TESSERA")
//!     .load()?;
//! # Ok(())
//! # }
//! ```
//!
//! # File format
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:8080"
//! shutdown_timeout_secs = 30
//! endpoint_path = "/ws"
//!
//! [websocket]
//! max_message_size = 67108864
//! fragment_size = 16384
//! keep_alive_interval_ms = 30000
//! close_timeout_ms = 1000
//! ping_timeout_ms = 1000
//! write_timeout_ms = 10000
//! event_queue_capacity = 64
//! text_encoding = "utf8"
//! compression = "deflate"
//! emit_ping_messages = false
//! engine = "native"
//!
//! [manager]
//! watchdog_enabled = true
//! watchdog_interval_ms = 30000
//! protocols = ["chat"]
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//!
//! [telemetry.metrics]
//! enabled = true
//! ```
//!
//! Any key can be overridden as `TESSERA__SECTION__KEY`, for example
//! `TESSERA__WEBSOCKET__COMPRESSION=none`.

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::TesseraConfig;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::ServerSection;
