//! Error codes raised while emitting reports.

use crate::errors::ErrorCode;

/// Encoding the report failed.
pub const ERR_ENCODE_REPORT: ErrorCode = ErrorCode("report.encode");
/// The HTTP request could not be built.
pub const ERR_BUILD_REQUEST: ErrorCode = ErrorCode("report.request_build");
/// The HTTP call itself failed.
pub const ERR_DO_REQUEST: ErrorCode = ErrorCode("report.request_do");
/// The endpoint answered with a non-success status.
pub const ERR_BAD_STATUS: ErrorCode = ErrorCode("report.bad_status");
/// One emission attempt of the reporter failed.
pub const ERR_EMIT_REPORT: ErrorCode = ErrorCode("report.emit");

/// Result type of emitters.
pub type ReportResult<T> = Result<T, crate::errors::CodedError>;
