//! Task outcome reporting.
//!
//! This module provides:
//! - `Report` and `ReportHandle`, the record a command fills in
//! - `Emitter` sinks (no-op and HTTP) and their resolution from the account
//! - `Reporter`, the background worker delivering reports with retries

pub mod emitter;
pub mod errors;
pub mod report;
pub mod reporter;

pub use emitter::{AccountEmitterResolver, Emitter, EmitterResolver, HttpEmitter, NullEmitter};
pub use errors::ReportResult;
pub use report::{Report, ReportHandle, ReportRepository, ReportSnapshot, ReportTask, TaskStatus};
pub use reporter::{Reporter, ReporterConfig};
