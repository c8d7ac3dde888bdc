//! RFC 6455 WebSocket engine for the Tessera server.
//!
//! This crate turns an accepted HTTP upgrade into a message-oriented
//! connection and supervises the connections of each endpoint on behalf of
//! application callbacks.
//!
//! # Features
//!
//! - **Native frame engine**: RFC 6455 framing, masking, fragmentation and
//!   the close handshake, implemented directly over any tokio byte stream
//! - **tungstenite engine**: the same interface backed by `tokio-tungstenite`
//! - **permessage-deflate** without context takeover
//! - **Ordered dispatch**: callbacks for one connection run one at a time
//! - **Connection manager**: subprotocol negotiation, registry, watchdog,
//!   broadcast and graceful shutdown
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessera_ws::{handler_fn, ConnectionManager, ManagerConfig, WebSocketRoutes};
//!
//! let mut routes = WebSocketRoutes::new();
//! routes.register("/echo", |path| {
//!     let handler = handler_fn(|_manager, ctx, payload, info| async move {
//!         ctx.send(payload, info.kind).await?;
//!         Ok(())
//!     });
//!     ConnectionManager::new(path, ManagerConfig::default(), Arc::new(handler))
//! })?;
//!
//! // In the HTTP service:
//! let response = routes.handle(request);
//! ```
//!
//! # Architecture
//!
//! ```text
//! HTTP upgrade ──► WebSocketRoutes::handle ──► ConnectionManager::negotiate
//!                                                   │ 101
//!                                                   ▼
//!                                      ConnectionManager::accept
//!                                        │                    │
//!                                        ▼                    ▼
//!                            receive loop (engine)     dispatcher task
//!                            Frame ─► Reassembler ─►   WebSocketHandler
//!                                     events channel   callbacks, in order
//! ```

pub mod compression;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod handler;
pub mod handshake;
mod keepalive;
pub mod manager;
pub mod message;
pub mod payload;
pub mod routes;
pub mod shutdown;
pub mod tungstenite_engine;

pub use compression::CompressionMethod;
pub use config::{EngineKind, ManagerConfig, WebSocketConfig};
pub use context::{
    BoxFuture, CloseStatus, ConnectionId, ConnectionState, SharedContext, WebSocketContext,
};
pub use engine::WebSocket;
pub use error::{CloseCode, FragmentError, FrameError, WsError, WsResult};
pub use frame::{Frame, FrameHeader, OpCode};
pub use handler::{handler_fn, FnHandler, HandlerError, HandlerResult, WebSocketHandler};
pub use handshake::{compute_accept_key, Handshake, HandshakeResponse, UpgradeRequest};
pub use manager::{ConnectionManager, ConnectionStats};
pub use message::{CloseFrame, FrameInfo, Message, MessageInfo, MessageKind, TextEncoding};
pub use payload::PayloadData;
pub use routes::WebSocketRoutes;
pub use shutdown::ShutdownSignal;
pub use tungstenite_engine::TungsteniteConnection;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports() {
        let _config = WebSocketConfig::default();
        let _manager_config = ManagerConfig::default();
        let _id = ConnectionId::new();
        let _msg = Message::text("hello");
        let _close = CloseCode::Normal;
        let _routes = WebSocketRoutes::new();
    }
}
