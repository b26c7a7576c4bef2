// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation token for turn executions.

use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation token propagated through every I/O call.
///
/// A thin wrapper around a `watch` channel whose value flips to `true`
/// exactly once. Clones share the same channel, so cancelling any clone is
/// observed by all of them; waiters subscribe on demand instead of holding
/// a receiver for the token's whole lifetime.
#[derive(Clone)]
pub struct CancelToken {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }

    /// Signal cancellation to all clones and waiters. Idempotent.
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    /// Returns `true` if cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Wait until cancellation is signalled (resolves immediately if it
    /// already was).
    pub async fn cancelled(&self) {
        let mut watcher = self.signal.subscribe();
        // The sender lives in `self`, which this future borrows, so the
        // channel cannot close underneath the wait.
        let _ = watcher.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
