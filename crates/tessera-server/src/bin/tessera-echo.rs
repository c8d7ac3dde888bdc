//! Echo server: every message received on the configured endpoint is sent
//! back to its sender.
//!
//! Configuration comes from `.env`, then the file named by the first
//! argument (default `tessera.toml`, optional), then `TESSERA__*`
//! environment variables.

use std::sync::Arc;

use anyhow::Context;
use tessera_config::ConfigLoader;
use tessera_server::{Server, ServerConfig};
use tessera_ws::{handler_fn, ConnectionManager, MessageKind, WebSocketRoutes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "tessera.toml".to_string());
    let config = ConfigLoader::new()
        .with_dotenv()?
        .with_optional_file(&path)
        .with_context(|| format!("loading {path}"))?
        .with_env_prefix("TESSERA")
        .load()
        .context("invalid configuration")?;

    tessera_telemetry::init_telemetry(&config.telemetry)?;

    let mut routes = WebSocketRoutes::new();
    let manager_config = config.manager_config();
    routes.register(&config.server.endpoint_path, |path| {
        let echo = handler_fn(|_manager, ctx, payload, info| async move {
            if info.kind != MessageKind::Ping {
                ctx.send(payload, info.kind).await?;
            }
            Ok(())
        });
        ConnectionManager::new(path, manager_config, Arc::new(echo))
    })?;

    Server::builder()
        .config(&ServerConfig::from(&config.server))
        .service_name("tessera-echo")
        .routes(routes)
        .build()
        .run()
        .await?;
    Ok(())
}
