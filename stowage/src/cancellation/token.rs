//! Process-wide cancellation token.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::watch;
use tracing::warn;

type Callback = Box<dyn FnOnce(&str) + Send>;

/// The single source of truth for "the user asked us to stop".
///
/// Cancellation is advisory and idempotent: only the first reason is kept and
/// every callback runs exactly once with that reason. Long-running work polls
/// [`CancellationToken::is_cancelled`] or awaits [`CancellationToken::cancelled`].
pub struct CancellationToken {
    reason: watch::Sender<Option<String>>,
    callbacks: Mutex<Vec<Callback>>,
}

impl CancellationToken {
    /// Creates an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            reason,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Requests cancellation. Later reasons are dropped.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if !first {
            return;
        }

        let pending = std::mem::take(&mut *self.callbacks.lock());
        for callback in pending {
            invoke(callback, &reason);
        }
    }

    /// Runs `callback` on cancellation, or right away if already cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let mut callbacks = self.callbacks.lock();
        match self.reason() {
            Some(reason) => {
                drop(callbacks);
                invoke(Box::new(callback), &reason);
            }
            None => callbacks.push(Box::new(callback)),
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.borrow().is_some()
    }

    /// Returns the first cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.borrow().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.reason.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(Option::is_some).await;
    }
}

fn invoke(callback: Callback, reason: &str) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(reason))) {
        warn!(?panic, "cancellation callback panicked");
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .field("pending_callbacks", &self.callbacks.lock().len())
            .finish()
    }
}
