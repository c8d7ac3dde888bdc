//! Ordered delivery of connection events to the handler.
//!
//! The receive loop never calls application code. It pushes events onto a
//! bounded channel, and a single dispatcher task per connection awaits
//! each callback before taking the next event. A full queue stops the
//! receive loop from reading, so a slow handler pushes back on the peer.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::context::{BoxFuture, SharedContext};
use crate::error::WsError;
use crate::handler::{HandlerError, HandlerResult};
use crate::manager::ConnectionManager;
use crate::message::{FrameInfo, MessageInfo};

/// Something that happened on a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection was registered.
    Connected,
    /// A frame arrived.
    Frame {
        /// Frame payload, still compressed if RSV1 was set.
        payload: Bytes,
        /// Frame metadata.
        info: FrameInfo,
    },
    /// A complete message arrived.
    Message {
        /// Reassembled, decompressed payload.
        payload: Bytes,
        /// Message metadata.
        info: MessageInfo,
    },
    /// The connection left the registry. Always the last event.
    Disconnected,
}

/// Producer side of a connection's event queue.
pub type EventSender = mpsc::Sender<ConnectionEvent>;

/// Consumer side of a connection's event queue.
pub type EventReceiver = mpsc::Receiver<ConnectionEvent>;

/// Create an event queue holding at most `capacity` events (at least one).
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Drain `events` into the manager's handler, one callback at a time.
///
/// Returns after [`ConnectionEvent::Disconnected`] has been handled or the
/// queue is closed.
pub(crate) async fn run_dispatcher(
    manager: Arc<ConnectionManager>,
    ctx: SharedContext,
    mut events: EventReceiver,
) {
    let handler = Arc::clone(manager.handler());

    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => {
                invoke(&ctx, "connected", handler.on_client_connected(&manager, &ctx)).await;
            }
            ConnectionEvent::Frame { payload, info } => {
                let fut = handler.on_frame_received(&manager, &ctx, &payload, info);
                invoke(&ctx, "frame", fut).await;
            }
            ConnectionEvent::Message { payload, info } => {
                let fut = handler.on_message_received(&manager, &ctx, payload, info);
                invoke(&ctx, "message", fut).await;
            }
            ConnectionEvent::Disconnected => {
                invoke(&ctx, "disconnected", handler.on_client_disconnected(&manager, &ctx)).await;
                break;
            }
        }
    }

    debug!(connection_id = %ctx.id(), "dispatcher finished");
}

/// Await one callback, logging its error or panic.
pub(crate) async fn invoke(
    ctx: &SharedContext,
    callback: &'static str,
    fut: BoxFuture<'_, HandlerResult>,
) {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            if let Some(failure) = connection_failure(&err) {
                debug!(
                    connection_id = %ctx.id(),
                    callback,
                    close_code = ?failure.close_code(),
                    error = %failure,
                    "websocket handler stopped by a connection failure"
                );
                return;
            }
            error!(
                connection_id = %ctx.id(),
                callback,
                error = %err,
                "websocket handler returned an error"
            );
        }
        Err(panic) => {
            error!(
                connection_id = %ctx.id(),
                callback,
                panic = panic_message(panic.as_ref()),
                "websocket handler panicked"
            );
        }
    }
}

/// The connection-level error behind a handler error, if there is one.
///
/// A callback that fails because its connection broke is not a handler bug.
fn connection_failure(err: &HandlerError) -> Option<&WsError> {
    err.downcast_ref::<WsError>().filter(|err| err.is_fatal())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
