//! Application callbacks.
//!
//! A [`WebSocketHandler`] is attached to one [`ConnectionManager`]. Every
//! callback receives the manager, so it can broadcast or look up other
//! connections, and the connection it concerns.
//!
//! ```rust,ignore
//! use tessera_ws::{handler_fn, MessageKind};
//!
//! let echo = handler_fn(|_manager, ctx, payload, info| async move {
//!     if info.kind != MessageKind::Ping {
//!         ctx.send(payload, info.kind).await?;
//!     }
//!     Ok(())
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::context::{BoxFuture, SharedContext};
use crate::manager::ConnectionManager;
use crate::message::{FrameInfo, MessageInfo};

/// Error returned by a callback. Logged and otherwise ignored.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a callback.
pub type HandlerResult = Result<(), HandlerError>;

/// Callbacks for one endpoint.
///
/// Callbacks for a single connection run one at a time, in the order the
/// events happened. Errors and panics are caught and logged.
pub trait WebSocketHandler: Send + Sync + 'static {
    /// A connection completed its handshake.
    fn on_client_connected<'a>(
        &'a self,
        _manager: &'a Arc<ConnectionManager>,
        _ctx: &'a SharedContext,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async { Ok(()) })
    }

    /// A connection was removed from the registry.
    fn on_client_disconnected<'a>(
        &'a self,
        _manager: &'a Arc<ConnectionManager>,
        _ctx: &'a SharedContext,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async { Ok(()) })
    }

    /// A frame was received, including intermediate fragments and control frames.
    fn on_frame_received<'a>(
        &'a self,
        _manager: &'a Arc<ConnectionManager>,
        _ctx: &'a SharedContext,
        _payload: &'a Bytes,
        _frame: FrameInfo,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async { Ok(()) })
    }

    /// A complete message was received.
    fn on_message_received<'a>(
        &'a self,
        manager: &'a Arc<ConnectionManager>,
        ctx: &'a SharedContext,
        payload: Bytes,
        message: MessageInfo,
    ) -> BoxFuture<'a, HandlerResult>;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler that only reacts to complete messages.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<ConnectionManager>, SharedContext, Bytes, MessageInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> WebSocketHandler for FnHandler<F>
where
    F: Fn(Arc<ConnectionManager>, SharedContext, Bytes, MessageInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn on_message_received<'a>(
        &'a self,
        manager: &'a Arc<ConnectionManager>,
        ctx: &'a SharedContext,
        payload: Bytes,
        message: MessageInfo,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin((self.f)(Arc::clone(manager), Arc::clone(ctx), payload, message))
    }
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}
