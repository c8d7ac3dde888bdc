//! The connection interface shared by both engines.
//!
//! Handlers, the manager and broadcast only ever see a [`SharedContext`].
//! Whether frames are produced by the native engine or by tungstenite is
//! decided once, at accept time.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{CloseCode, WsResult};
use crate::message::{Message, MessageKind, TextEncoding};
use crate::shutdown::ShutdownSignal;

/// A boxed, sendable future, the return type of every async trait method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A connection as held by the registry and passed to handlers.
pub type SharedContext = Arc<dyn WebSocketContext>;

/// A unique identifier for a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new time-ordered connection ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Lifecycle of a server-side connection.
///
/// ```text
/// Open ──close()/fatal error──▶ CloseSent ─────┐
///   │                                          ├──teardown──▶ Closed
///   └──peer Close──▶ CloseReceived ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake completed; frames flow both ways.
    Open,
    /// We sent a Close frame and wait for the peer's.
    CloseSent,
    /// The peer sent a Close frame; ours is the echo.
    CloseReceived,
    /// The stream has been released.
    Closed,
}

impl ConnectionState {
    /// Whether application data can still be sent.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::CloseSent => "close_sent",
            Self::CloseReceived => "close_received",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Close code, possibly a reserved local-only one.
    pub code: u16,
    /// Close reason; empty if none was given.
    pub reason: String,
}

impl CloseStatus {
    /// Build a status from a known code.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: reason.into(),
        }
    }
}

/// One accepted WebSocket connection.
///
/// Methods that touch the stream return a [`BoxFuture`] so the trait stays
/// object safe.
pub trait WebSocketContext: Send + Sync + 'static {
    /// Registry key.
    fn id(&self) -> ConnectionId;

    /// Endpoint path the connection was accepted on.
    fn path(&self) -> &str;

    /// Negotiated subprotocol, if any.
    fn protocol(&self) -> Option<&str>;

    /// Current state.
    fn state(&self) -> ConnectionState;

    /// How the connection ended, once it is closing or closed.
    fn close_status(&self) -> Option<CloseStatus>;

    /// Encoding used for Text payloads.
    fn text_encoding(&self) -> TextEncoding;

    /// Send one message, fragmenting it as configured.
    ///
    /// Concurrent calls never interleave frames on the wire.
    fn send(&self, payload: Bytes, kind: MessageKind) -> BoxFuture<'_, WsResult<()>>;

    /// Send a Ping and report whether a Pong arrived within the ping timeout.
    fn ping(&self) -> BoxFuture<'_, bool>;

    /// Start the close handshake. A no-op unless the connection is open.
    ///
    /// Reserved codes such as [`CloseCode::Abnormal`] skip the Close frame
    /// and tear the stream down directly.
    fn close(&self, code: CloseCode, reason: String) -> BoxFuture<'_, ()>;

    /// Completes once the connection reaches [`ConnectionState::Closed`].
    fn closed(&self) -> BoxFuture<'_, ()>;

    /// Drive the receive loop until the connection is closed.
    ///
    /// Triggering `shutdown` closes an open connection with `GoingAway`.
    fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> BoxFuture<'static, ()>;

    /// Send text, encoded with the connection's text encoding.
    fn send_text<'a>(&'a self, text: &'a str) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(async move {
            let payload = self.text_encoding().encode(text)?;
            self.send(payload, MessageKind::Text).await
        })
    }

    /// Send binary data.
    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, WsResult<()>> {
        self.send(data, MessageKind::Binary)
    }

    /// Send a [`Message`]. Close messages start the close handshake.
    fn send_message(&self, message: Message) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(async move {
            match message {
                Message::Text(text) => self.send_text(&text).await,
                Message::Binary(data) => self.send(data, MessageKind::Binary).await,
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| {
                            let code = f.close_code().unwrap_or(CloseCode::Normal);
                            (code, f.reason.into_owned())
                        })
                        .unwrap_or((CloseCode::Normal, String::new()));
                    self.close(code, reason).await;
                    Ok(())
                }
                Message::Ping(_) => {
                    self.ping().await;
                    Ok(())
                }
                // Pongs are answered by the engine itself.
                Message::Pong(_) => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_connection_id_display() {
        let uuid = Uuid::now_v7();
        let id = ConnectionId::from(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::CloseSent.is_open());
        assert!(!ConnectionState::CloseReceived.is_open());
        assert!(!ConnectionState::Closed.is_open());
        assert_eq!(ConnectionState::CloseSent.to_string(), "close_sent");
    }

    #[test]
    fn test_close_status() {
        let status = CloseStatus::new(CloseCode::GoingAway, "restart");
        assert_eq!(status.code, 1001);
        assert_eq!(status.reason, "restart");
    }
}
