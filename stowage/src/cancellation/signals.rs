//! Interrupt and terminate handling.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::utils::Console;

/// The OS signals the handler listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminated"),
        }
    }
}

type InterruptCallback = Box<dyn Fn(Signal) + Send + Sync>;

struct Shared {
    fired: AtomicBool,
    console: Arc<Console>,
    on_interrupt: InterruptCallback,
}

impl Shared {
    fn dispatch(&self, signal: Signal) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%signal, "signal ignored, interrupt already in progress");
            return false;
        }

        self.console.eprintln(format!("\nReceived signal: {signal}"));
        self.console.eprintln("Interrupting, it might take a while...");
        (self.on_interrupt)(signal);
        true
    }
}

/// Listens for interrupt/terminate signals and fires a callback on the first one.
///
/// Later signals are swallowed: the default disposition is not restored, so a
/// second Ctrl-C does not kill the process in the middle of cleanup.
pub struct SignalHandler {
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalHandler {
    /// Installs the OS handlers and starts the listener task.
    ///
    /// The interruption notice is written to `console`. Must be called from
    /// within a tokio runtime.
    pub fn start<F>(console: Arc<Console>, on_interrupt: F) -> std::io::Result<Self>
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        let handler = Self::detached(console, on_interrupt);
        let shared = handler.shared.clone();
        let shutdown = handler.shutdown.clone();

        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let task = tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                let signal = tokio::select! {
                    _ = shutdown.notified() => break,
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => Signal::Interrupt,
                        Err(_) => break,
                    },
                    _ = terminate.recv() => Signal::Terminate,
                };
                #[cfg(not(unix))]
                let signal = tokio::select! {
                    _ = shutdown.notified() => break,
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => Signal::Interrupt,
                        Err(_) => break,
                    },
                };
                shared.dispatch(signal);
            }
            debug!("signal listener stopped");
        });

        *handler.task.lock() = Some(task);
        Ok(handler)
    }

    /// Creates a handler that is not attached to the OS.
    ///
    /// Signals only arrive through [`SignalHandler::dispatch`].
    #[must_use]
    pub fn detached<F>(console: Arc<Console>, on_interrupt: F) -> Self
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                fired: AtomicBool::new(false),
                console,
                on_interrupt: Box::new(on_interrupt),
            }),
            shutdown: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Delivers a signal. Returns true if this delivery fired the callback.
    pub fn dispatch(&self, signal: Signal) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.dispatch(signal)
    }

    /// Returns whether a signal has been received.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.shared.fired.load(Ordering::SeqCst)
    }

    /// Deregisters the OS handlers. Idempotent.
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // notify_one stores a permit, so a listener that is not parked yet still exits.
        self.shutdown.notify_one();
        self.task.lock().take();
    }

    /// Returns whether [`SignalHandler::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandler")
            .field("fired", &self.has_fired())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn console() -> Arc<Console> {
        Arc::new(Console::captured().0)
    }

    #[test]
    fn test_two_signals_fire_callback_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = SignalHandler::detached(console(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handler.dispatch(Signal::Interrupt));
        assert!(!handler.dispatch(Signal::Terminate));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handler.has_fired());
    }

    #[test]
    fn test_concurrent_signals_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = Arc::new(SignalHandler::detached(console(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let h = handler.clone();
                std::thread::spawn(move || h.dispatch(Signal::Interrupt))
            })
            .collect();
        let fired: usize = threads
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();

        assert_eq!(fired, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_cancels_token() {
        let token = Arc::new(CancellationToken::new());
        let t = token.clone();
        let handler = SignalHandler::detached(console(), move |signal| t.cancel(signal.to_string()));

        handler.dispatch(Signal::Terminate);

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("terminated".to_string()));
    }

    #[test]
    fn test_stop_is_idempotent_and_ignores_later_signals() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = SignalHandler::detached(console(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        handler.stop();
        handler.stop();

        assert!(handler.is_stopped());
        assert!(!handler.dispatch(Signal::Interrupt));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_notice_written_once_to_console() {
        let (console, _, stderr) = Console::captured();
        let handler = SignalHandler::detached(Arc::new(console), |_| {});

        handler.dispatch(Signal::Interrupt);
        handler.dispatch(Signal::Interrupt);

        let err = stderr.contents();
        assert_eq!(err.matches("Received signal: interrupt").count(), 1);
        assert_eq!(err.matches("Interrupting, it might take a while...").count(), 1);
    }

    #[tokio::test]
    async fn test_started_listener_exits_on_stop() {
        let handler = SignalHandler::start(console(), |_| {}).unwrap();
        let task = handler.task.lock().take().unwrap();

        handler.stop();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener should exit")
            .unwrap();
    }
}
