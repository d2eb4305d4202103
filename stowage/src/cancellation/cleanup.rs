//! Cleanup registry executed in LIFO order.

use crate::errors::CleanupError;
use parking_lot::Mutex;
use tracing::{debug, warn};

type FallibleAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type InfallibleAction = Box<dyn FnOnce() + Send>;

struct Named<T> {
    name: String,
    action: T,
}

/// Ordered collection of cleanup actions.
///
/// [`CleanupRegistry::close`] runs every fallible action in reverse
/// registration order, then every infallible action in reverse registration
/// order. Each action runs exactly once; actions registered after a close run
/// on the next close.
#[derive(Default)]
pub struct CleanupRegistry {
    fallible: Mutex<Vec<Named<FallibleAction>>>,
    infallible: Mutex<Vec<Named<InfallibleAction>>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action whose failure is reported by [`CleanupRegistry::close`].
    pub fn register<F>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.fallible.lock().push(Named {
            name: name.into(),
            action: Box::new(action),
        });
    }

    /// Registers an action that cannot fail.
    pub fn register_infallible<F>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.infallible.lock().push(Named {
            name: name.into(),
            action: Box::new(action),
        });
    }

    /// Runs all pending actions and aggregates failures.
    ///
    /// A panicking action is recorded as a failure and does not stop the others.
    pub fn close(&self) -> Result<(), CleanupError> {
        let fallible = std::mem::take(&mut *self.fallible.lock());
        let infallible = std::mem::take(&mut *self.infallible.lock());

        let mut failures = Vec::new();

        for entry in fallible.into_iter().rev() {
            debug!(action = %entry.name, "running cleanup");
            let action = entry.action;
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(action = %entry.name, error = %e, "cleanup failed");
                    failures.push((entry.name, e.to_string()));
                }
                Err(panic) => {
                    let msg = format!("cleanup panicked: {panic:?}");
                    warn!(action = %entry.name, "{}", msg);
                    failures.push((entry.name, msg));
                }
            }
        }

        for entry in infallible.into_iter().rev() {
            debug!(action = %entry.name, "running cleanup");
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry.action)) {
                warn!(action = %entry.name, "cleanup panicked: {:?}", panic);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }

    /// Returns the number of pending cleanup actions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.fallible.lock().len() + self.infallible.lock().len()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}
