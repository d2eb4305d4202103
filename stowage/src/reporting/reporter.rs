//! Background report delivery.

use super::emitter::{Emitter, EmitterResolver};
use super::errors::ERR_EMIT_REPORT;
use super::report::{InFlight, Report, ReportHandle};
use crate::cancellation::CancellationToken;
use crate::errors::{CodedError, ErrorObservers};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Tuning of a [`Reporter`].
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Capacity of the report queue; publishing waits while it is full.
    pub queue_capacity: usize,
    /// Emission attempts per report.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, doubled after each one.
    ///
    /// No delay follows the final attempt: once the budget is spent the report
    /// is dropped right away, so a draining reporter is not held for another
    /// backoff period before exit.
    pub backoff_unit: Duration,
    /// How long a resolved emitter is reused.
    pub emitter_ttl: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_attempts: 3,
            backoff_unit: Duration::from_secs(60),
            emitter_ttl: Duration::from_secs(60),
        }
    }
}

impl ReporterConfig {
    /// Millisecond delays, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            backoff_unit: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * (1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Delivers published reports on a single background task.
///
/// Reports are processed in publish order. [`Reporter::stop_and_wait`] returns
/// once every report obtained from [`Reporter::new_report`] has been emitted,
/// dropped after exhausting its attempts, or discarded unpublished.
pub struct Reporter {
    tx: mpsc::Sender<Report>,
    in_flight: Arc<InFlight>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    observers: Arc<ErrorObservers>,
}

impl Reporter {
    /// Spawns the worker on the current tokio runtime.
    ///
    /// The worker also starts draining when `cancel` fires.
    pub fn new(
        config: ReporterConfig,
        resolver: Arc<dyn EmitterResolver>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let in_flight = Arc::new(InFlight::default());
        let observers = Arc::new(ErrorObservers::logging("reporting"));

        let worker = Worker {
            config,
            resolver,
            cached: None,
            in_flight: in_flight.clone(),
            observers: observers.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, stop_rx, cancel));

        Self {
            tx,
            in_flight,
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(handle)),
            observers,
        }
    }

    /// Starts a new report bound to this reporter.
    #[must_use]
    pub fn new_report(&self) -> ReportHandle {
        ReportHandle::new(self.tx.clone(), self.in_flight.clone())
    }

    /// Observer list notified of every failed emission attempt.
    #[must_use]
    pub fn observers(&self) -> &Arc<ErrorObservers> {
        &self.observers
    }

    /// Reports obtained and not yet fully processed.
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.count()
    }

    /// Asks the worker to drain and waits for it to exit. Idempotent.
    pub async fn stop_and_wait(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "reporter worker failed");
            }
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("in_flight", &self.in_flight())
            .field("stopped", &self.worker.lock().is_none())
            .finish_non_exhaustive()
    }
}

struct Worker {
    config: ReporterConfig,
    resolver: Arc<dyn EmitterResolver>,
    cached: Option<(Arc<dyn Emitter>, Instant)>,
    in_flight: Arc<InFlight>,
    observers: Arc<ErrorObservers>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Report>,
        mut stop: oneshot::Receiver<()>,
        cancel: Arc<CancellationToken>,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("reporter cancelled, draining");
                    break;
                }
                _ = &mut stop => {
                    debug!("reporter stopping, draining");
                    break;
                }
                received = rx.recv() => match received {
                    Some(report) => self.process(report).await,
                    None => break,
                },
            }
        }

        // Handles dropped unpublished never reach the queue; their release
        // wakes this loop instead.
        let in_flight = self.in_flight.clone();
        while in_flight.count() > 0 {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(report) => self.process(report).await,
                    None => break,
                },
                () = in_flight.released() => {}
            }
        }
        rx.close();
        debug!("reporter stopped");
    }

    async fn emitter(&mut self) -> Arc<dyn Emitter> {
        if let Some((emitter, resolved_at)) = &self.cached {
            if resolved_at.elapsed() < self.config.emitter_ttl {
                return emitter.clone();
            }
        }
        let emitter = self.resolver.resolve().await;
        self.cached = Some((emitter.clone(), Instant::now()));
        emitter
    }

    async fn process(&mut self, report: Report) {
        if report.ignore {
            debug!("ignoring report");
        } else {
            self.deliver(&report).await;
        }
        self.in_flight.release();
    }

    async fn deliver(&mut self, report: &Report) {
        let emitter = self.emitter().await;
        let max = self.config.max_attempts.max(1);

        for attempt in 1..=max {
            match emitter.emit(report).await {
                Ok(()) => return,
                Err(e) => {
                    self.observers.emit(attempt_error(e, report, attempt, max));
                    if attempt < max {
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                    }
                }
            }
        }
        error!(attempts = max, "failed to emit report after {max} attempts");
    }
}

fn attempt_error(cause: CodedError, report: &Report, attempt: u32, max: u32) -> CodedError {
    let mut err = CodedError::wrap(
        ERR_EMIT_REPORT,
        cause,
        format!("failed to emit report (attempt {attempt}/{max})"),
    )
    .with_context("attempt", attempt)
    .with_context("max_attempts", max);
    if let Some(task) = &report.task {
        err = err
            .with_context("task", task.name.as_str())
            .with_context("task_type", task.kind.as_str());
    }
    if let Some(repository) = &report.repository {
        err = err.with_context("repository", repository.name.as_str());
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingResolver, FailingEmitter, RecordingEmitter};
    use pretty_assertions::assert_eq;

    fn reporter_with(emitter: Arc<dyn Emitter>, config: ReporterConfig) -> (Reporter, Arc<CountingResolver>) {
        let resolver = Arc::new(CountingResolver::new(emitter));
        let reporter = Reporter::new(config, resolver.clone(), Arc::new(CancellationToken::new()));
        (reporter, resolver)
    }

    async fn publish(reporter: &Reporter, name: &str) {
        let mut report = reporter.new_report();
        report.task_start("backup", name);
        report.task_done().await;
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ReporterConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(60));
        assert_eq!(config.backoff(2), Duration::from_secs(120));
        assert_eq!(config.backoff(3), Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_stop_with_nothing_published() {
        let emitter = Arc::new(RecordingEmitter::new());
        let (reporter, _) = reporter_with(emitter.clone(), ReporterConfig::fast());

        reporter.stop_and_wait().await;
        reporter.stop_and_wait().await;
        assert!(emitter.names().is_empty());
    }

    #[tokio::test]
    async fn test_drains_backlog_in_order() {
        let emitter = Arc::new(RecordingEmitter::new());
        let config = ReporterConfig::fast();
        let total = config.queue_capacity + 10;
        let (reporter, _) = reporter_with(emitter.clone(), config);

        for i in 0..total {
            publish(&reporter, &format!("task-{i}")).await;
        }
        reporter.stop_and_wait().await;

        let names = emitter.names();
        assert_eq!(names.len(), total);
        assert_eq!(names[0], "task-0");
        assert_eq!(names[total - 1], format!("task-{}", total - 1));
        assert_eq!(reporter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_slow_emitter() {
        let emitter = Arc::new(RecordingEmitter::new().with_delay(Duration::from_millis(20)));
        let (reporter, _) = reporter_with(emitter.clone(), ReporterConfig::fast());

        for i in 0..5 {
            publish(&reporter, &format!("slow-{i}")).await;
        }
        reporter.stop_and_wait().await;
        assert_eq!(emitter.names().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_attempts_are_observed() {
        let emitter = Arc::new(FailingEmitter::new());
        let (reporter, _) = reporter_with(emitter.clone(), ReporterConfig::fast());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        reporter.observers().register(move |e| {
            s.lock().push((e.code, e.context["attempt"].clone(), e.context["task"].clone()));
        });

        let mut report = reporter.new_report();
        report.task_start("check", "weekly");
        report.with_repository_name("fs:/nas");
        report.task_done().await;
        reporter.stop_and_wait().await;

        assert_eq!(emitter.calls(), 3);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(code, _, task)| *code == ERR_EMIT_REPORT && task == "weekly"));
        assert_eq!(seen[2].1, 3);
    }

    #[tokio::test]
    async fn test_ignored_reports_are_not_emitted() {
        let emitter = Arc::new(RecordingEmitter::new());
        let (reporter, _) = reporter_with(emitter.clone(), ReporterConfig::fast());

        let mut report = reporter.new_report();
        report.set_ignore();
        report.task_start("", "version");
        report.task_done().await;
        publish(&reporter, "kept").await;
        reporter.stop_and_wait().await;

        assert_eq!(emitter.names(), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_emitter_cached_for_ttl() {
        let emitter = Arc::new(RecordingEmitter::new());
        let (reporter, resolver) = reporter_with(emitter.clone(), ReporterConfig::fast());
        for i in 0..4 {
            publish(&reporter, &format!("r{i}")).await;
        }
        reporter.stop_and_wait().await;
        assert_eq!(resolver.calls(), 1);

        let config = ReporterConfig {
            emitter_ttl: Duration::ZERO,
            ..ReporterConfig::fast()
        };
        let (reporter, resolver) = reporter_with(emitter, config);
        for i in 0..4 {
            publish(&reporter, &format!("r{i}")).await;
        }
        reporter.stop_and_wait().await;
        assert_eq!(resolver.calls(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_drains_pending() {
        let emitter = Arc::new(RecordingEmitter::new().with_delay(Duration::from_millis(5)));
        let cancel = Arc::new(CancellationToken::new());
        let reporter = Reporter::new(
            ReporterConfig::fast(),
            Arc::new(CountingResolver::new(emitter.clone())),
            cancel.clone(),
        );

        for i in 0..3 {
            publish(&reporter, &format!("c{i}")).await;
        }
        cancel.cancel("interrupt");
        reporter.stop_and_wait().await;

        assert_eq!(emitter.names().len(), 3);
    }

    #[tokio::test]
    async fn test_unpublished_handle_does_not_block_shutdown() {
        let emitter = Arc::new(RecordingEmitter::new());
        let (reporter, _) = reporter_with(emitter.clone(), ReporterConfig::fast());

        let report = reporter.new_report();
        drop(report);
        publish(&reporter, "after").await;

        tokio::time::timeout(Duration::from_secs(5), reporter.stop_and_wait())
            .await
            .unwrap();
        assert_eq!(emitter.names(), vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_dropped_while_draining_releases_shutdown() {
        let emitter = Arc::new(RecordingEmitter::new());
        let (reporter, _) = reporter_with(emitter.clone(), ReporterConfig::fast());
        let reporter = Arc::new(reporter);

        let report = reporter.new_report();
        let stopping = {
            let reporter = reporter.clone();
            tokio::spawn(async move { reporter.stop_and_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        drop(report);
        tokio::time::timeout(Duration::from_secs(2), stopping)
            .await
            .expect("shutdown should finish once the handle is dropped")
            .unwrap();
        assert_eq!(reporter.in_flight(), 0);
        assert!(emitter.names().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_command_dropping_its_report() {
        let emitter = Arc::new(RecordingEmitter::new());
        let cancel = Arc::new(CancellationToken::new());
        let reporter = Reporter::new(
            ReporterConfig::fast(),
            Arc::new(CountingResolver::new(emitter.clone())),
            cancel.clone(),
        );

        let mut report = reporter.new_report();
        report.task_start("backup", "interrupted");
        cancel.cancel("interrupt");
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(report);

        tokio::time::timeout(Duration::from_secs(2), reporter.stop_and_wait())
            .await
            .unwrap();
        assert!(emitter.names().is_empty());
    }
}
