//! Task outcome records.

use crate::config::StoreConfig;
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Final state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Completed without problems.
    Ok,
    /// Completed with warnings.
    Warning,
    /// Did not complete.
    Failed,
}

/// Task section of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportTask {
    /// Task kind (`backup`, `check`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Task name.
    pub name: String,
    /// When the task started.
    pub started_at: DateTime<Utc>,
    /// How long the task ran.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Outcome; absent until the task ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// Error code for failed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    /// Error or warning message.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip)]
    started: Option<Instant>,
}

impl ReportTask {
    /// Starts a task section now.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            status: None,
            error_code: None,
            error_message: String::new(),
            started: Some(Instant::now()),
        }
    }
}

/// Repository section of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRepository {
    /// Repository name or location.
    pub name: String,
    /// Store header of the repository, when opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<serde_json::Value>,
}

/// Snapshot section of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSnapshot {
    /// Summary of the snapshot header.
    pub header: serde_json::Value,
}

/// The record delivered to emitters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    /// Publication time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Task outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<ReportTask>,
    /// Repository the task ran against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<ReportRepository>,
    /// Snapshot produced by the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ReportSnapshot>,
    /// Processed but never emitted.
    #[serde(skip)]
    pub ignore: bool,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Count of reports obtained from a reporter and not yet fully processed.
///
/// Every release wakes one waiter, so a draining worker re-checks the count
/// even when the last release comes from a dropped handle.
#[derive(Debug, Default)]
pub(super) struct InFlight {
    count: AtomicI64,
    released: Notify,
}

impl InFlight {
    fn acquire(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn release(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_one();
    }

    pub(super) fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Completes after the next release, or at once if one is pending.
    pub(super) async fn released(&self) {
        self.released.notified().await;
    }
}

/// A report being filled in by the running command.
///
/// Ending the task publishes the report and consumes the handle, so a report
/// is published at most once. A handle dropped without publishing releases its
/// slot in the reporter's in-flight count.
pub struct ReportHandle {
    report: Option<Report>,
    tx: mpsc::Sender<Report>,
    in_flight: Arc<InFlight>,
}

impl ReportHandle {
    pub(super) fn new(tx: mpsc::Sender<Report>, in_flight: Arc<InFlight>) -> Self {
        in_flight.acquire();
        Self {
            report: Some(Report::default()),
            tx,
            in_flight,
        }
    }

    fn report_mut(&mut self) -> &mut Report {
        self.report.get_or_insert_with(Report::default)
    }

    /// Processes the report without emitting it.
    pub fn set_ignore(&mut self) {
        self.report_mut().ignore = true;
    }

    /// Starts the task section.
    pub fn task_start(&mut self, kind: impl Into<String>, name: impl Into<String>) {
        let report = self.report_mut();
        if report.task.is_some() {
            warn!("already in a task");
        }
        report.task = Some(ReportTask::new(kind, name));
    }

    /// Names the repository the task runs against.
    pub fn with_repository_name(&mut self, name: impl Into<String>) {
        let report = self.report_mut();
        if report.repository.is_some() {
            warn!("already has a repository");
        }
        report.repository = Some(ReportRepository {
            name: name.into(),
            storage: None,
        });
    }

    /// Attaches the repository's store header. KDF material is replaced by a flag.
    pub fn with_repository(&mut self, repository: &Repository) {
        let storage = repository.configuration().and_then(|c| {
            let mut value = serde_json::to_value(c).ok()?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("encryption".into(), serde_json::Value::Bool(c.is_encrypted()));
            }
            Some(value)
        });
        let report = self.report_mut();
        match report.repository.as_mut() {
            Some(repo) => repo.storage = storage,
            None => {
                report.repository = Some(ReportRepository {
                    name: repository.location(),
                    storage,
                });
            }
        }
    }

    /// Attaches a store configuration, with secrets stripped.
    pub fn with_store_config(&mut self, config: &StoreConfig) {
        let mut public = config.clone();
        public.retain(|k, _| !k.contains("passphrase") && !k.contains("secret") && !k.contains("key"));
        let value = serde_json::to_value(public).ok();
        let report = self.report_mut();
        if let Some(repo) = report.repository.as_mut() {
            if repo.storage.is_none() {
                repo.storage = value;
            }
        }
    }

    /// Attaches a snapshot summary.
    pub fn with_snapshot(&mut self, header: serde_json::Value) {
        let report = self.report_mut();
        if report.snapshot.is_some() {
            warn!("already has a snapshot");
        }
        report.snapshot = Some(ReportSnapshot { header });
    }

    /// Returns the report as filled in so far.
    #[must_use]
    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    /// Ends the task successfully and publishes.
    pub async fn task_done(self) {
        self.task_end(TaskStatus::Ok, None, String::new()).await;
    }

    /// Ends the task with a warning and publishes.
    pub async fn task_warning(self, message: impl Into<String>) {
        self.task_end(TaskStatus::Warning, None, message.into()).await;
    }

    /// Ends the task as failed and publishes.
    pub async fn task_failed(self, code: u32, message: impl Into<String>) {
        self.task_end(TaskStatus::Failed, Some(code), message.into()).await;
    }

    async fn task_end(mut self, status: TaskStatus, code: Option<u32>, message: String) {
        let report = self.report_mut();
        let task = report.task.get_or_insert_with(|| ReportTask::new("", ""));
        task.status = Some(status);
        task.error_code = code;
        task.error_message = message;
        task.duration = task.started.map_or(Duration::ZERO, |s| s.elapsed());
        self.publish().await;
    }

    /// Stamps the report and queues it, waiting while the queue is full.
    pub async fn publish(mut self) {
        let Some(mut report) = self.report.take() else {
            return;
        };
        report.timestamp = Some(Utc::now());
        if self.tx.send(report).await.is_err() {
            debug!("reporter stopped, report dropped");
            self.in_flight.release();
        }
    }
}

impl Drop for ReportHandle {
    fn drop(&mut self) {
        if self.report.take().is_some() {
            self.in_flight.release();
        }
    }
}

impl std::fmt::Debug for ReportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportHandle")
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}
