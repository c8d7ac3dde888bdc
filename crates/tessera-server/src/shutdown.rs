//! Graceful shutdown.
//!
//! [`os_shutdown_signal`] turns SIGTERM or SIGINT into a
//! [`ShutdownSignal`], and [`ConnectionTracker`] lets the server wait for
//! in-flight HTTP connections before it returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tessera_ws::ShutdownSignal;
use tokio::sync::Notify;

/// A signal triggered by SIGTERM or SIGINT (Ctrl+C elsewhere).
///
/// Must be called inside a tokio runtime. If no handler can be installed
/// the error is logged and the signal only fires when triggered by hand.
pub fn os_shutdown_signal() -> ShutdownSignal {
    let signal = ShutdownSignal::new();
    let trigger = signal.clone();

    tokio::spawn(async move {
        if wait_for_os_signal().await {
            trigger.trigger();
        }
    });

    signal
}

#[cfg(unix)]
async fn wait_for_os_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "failed to install signal handlers");
                return false;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C, shutting down");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            false
        }
    }
}

/// Counts live HTTP connections.
///
/// ```rust
/// use tessera_server::ConnectionTracker;
///
/// let tracker = ConnectionTracker::new();
/// let token = tracker.acquire();
/// assert_eq!(tracker.active_connections(), 1);
/// drop(token);
/// assert_eq!(tracker.active_connections(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl ConnectionTracker {
    /// Creates a tracker with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a connection until the token is dropped.
    #[must_use]
    pub fn acquire(&self) -> ConnectionToken {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionToken {
            active: Arc::clone(&self.active),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Completes once no connection is live.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by each connection task; decrements the tracker on drop.
#[derive(Debug)]
pub struct ConnectionToken {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tracker_counts_tokens() {
        let tracker = ConnectionTracker::new();
        let first = tracker.acquire();
        let second = tracker.acquire();
        assert_eq!(tracker.active_connections(), 2);

        drop(first);
        assert_eq!(tracker.active_connections(), 1);
        drop(second);
        assert_eq!(tracker.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_drain_immediate() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_millis(10), tracker.wait_for_drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_last_token() {
        let tracker = ConnectionTracker::new();
        let token = tracker.acquire();

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_drain().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(token);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_os_signal_starts_untriggered() {
        let signal = os_shutdown_signal();
        assert!(!signal.is_shutdown());
    }
}
