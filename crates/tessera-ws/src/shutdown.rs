//! Cooperative cancellation.
//!
//! A [`ShutdownSignal`] is shared by a connection manager, every receive
//! loop it spawns and its watchdog. Triggering it makes open connections
//! send `GoingAway` and stops the watchdog at its next tick.
//!
//! ```rust
//! use tessera_ws::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let observer = shutdown.clone();
//!
//! shutdown.trigger();
//! assert!(observer.is_shutdown());
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// A clonable, idempotent cancellation flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Creates a signal that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Triggers the signal. Later calls do nothing.
    pub fn trigger(&self) {
        self.sender.send_if_modified(|triggered| !std::mem::replace(triggered, true));
    }

    /// Returns `true` once [`trigger`](Self::trigger) has been called on any clone.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// A future that completes when the signal is triggered.
    ///
    /// Completes immediately if it already was. The future owns its
    /// subscription, so it can be moved into spawned tasks.
    pub fn recv(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            // An error means every signal was dropped, which also ends the wait.
            let _ = receiver.wait_for(|triggered| *triggered).await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shutdown_signal_trigger_idempotent() {
        let signal = ShutdownSignal::default();
        assert!(!signal.is_shutdown());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_shutdown_signal_shared_between_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_recv_completes_when_triggered() {
        let signal = ShutdownSignal::new();
        let waiter = tokio::spawn(signal.recv());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv should complete")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn test_recv_completes_immediately_if_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(10), signal.recv())
            .await
            .expect("recv should complete immediately");
    }
}
