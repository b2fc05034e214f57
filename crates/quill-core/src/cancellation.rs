//! Cooperative stop signalling for multi-cycle async loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative stop token shared between a controller and its async loops.
///
/// Loops check `is_stopped` before every resumption point; `stop` wakes any
/// pending `stopped` waiters so timed waits end promptly.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl StopToken {
    /// Creates a new, not-yet-stopped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as stopped and wakes pending waiters.
    pub fn stop(&self) {
        let already_stopped = self.stopped.swap(true, Ordering::SeqCst);
        if !already_stopped {
            self.notify.notify_waiters();
        }
    }

    /// Returns true once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Re-arms the token for a fresh run.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Resolves when a stop has been requested.
    pub async fn stopped(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Sleeps for `duration` unless the token stops first; returns true when the
/// full sleep elapsed.
pub async fn sleep_unless_stopped(token: &StopToken, duration: Duration) -> bool {
    if token.is_stopped() {
        return false;
    }
    tokio::select! {
        _ = token.stopped() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
