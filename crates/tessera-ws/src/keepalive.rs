//! Background tasks tied to a connection's lifetime.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::context::SharedContext;
use crate::error::CloseCode;
use crate::shutdown::ShutdownSignal;

/// Spawn the shutdown watcher and, for a non-zero `interval`, the keep-alive pinger.
///
/// Both tasks exit once the connection is closed.
pub(crate) fn spawn_watchers(ctx: SharedContext, shutdown: ShutdownSignal, interval: Duration) {
    if !interval.is_zero() {
        tokio::spawn(keep_alive(ctx.clone(), interval));
    }

    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.recv() => {
                ctx.close(CloseCode::GoingAway, "server shutting down".to_string()).await;
            }
            () = ctx.closed() => {}
        }
    });
}

async fn keep_alive(ctx: SharedContext, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !ctx.state().is_open() {
                    return;
                }
                if !ctx.ping().await {
                    // A miss after the peer started closing is not a failure.
                    if ctx.state().is_open() {
                        warn!(connection_id = %ctx.id(), "keep-alive ping unanswered");
                        ctx.close(CloseCode::Abnormal, "keep-alive timeout".to_string()).await;
                    }
                    return;
                }
            }
            () = ctx.closed() => return,
        }
    }
}
