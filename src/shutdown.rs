//! Process-wide shutdown flag.
//!
//! Every long-running task holds a clone of [`Shutdown`] and either polls
//! [`Shutdown::is_triggered`] or races its own work against
//! [`Shutdown::wait`]. Sleeps that must end early on shutdown go through
//! [`Shutdown::sleep`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cloneable, one-way shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|running_down| {
            if *running_down {
                false
            } else {
                *running_down = true;
                true
            }
        });
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once shutdown is triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|running_down| *running_down).await;
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` when the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
