//! Validation of user-supplied paths and files.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Input rejected by validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The path is empty.
    #[error("invalid input: empty path")]
    EmptyPath,

    /// The path contains a NUL byte or an encoded traversal.
    #[error("invalid input: suspicious sequence in path")]
    SuspiciousPath,

    /// The file can be modified by other users.
    #[error("invalid input: {0} is writable by group or others")]
    Writable(String),

    /// The file has the setuid or setgid bit.
    #[error("invalid input: {0} has setuid/setgid bit set")]
    SetId(String),

    /// The file could not be inspected.
    #[error("cannot stat {path}: {message}")]
    Stat {
        /// Inspected path.
        path: String,
        /// Underlying failure.
        message: String,
    },
}

const ENCODED_PATTERNS: &[&str] = &["%00", "%2e%2e", "%2E%2E"];

/// Rejects suspicious paths and returns a lexically cleaned copy.
///
/// `.` components are dropped and `dir/..` pairs are collapsed; a leading
/// `..` is kept.
pub fn sanitize_path(path: &str) -> Result<PathBuf, ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if path.contains('\0') || ENCODED_PATTERNS.iter().any(|p| path.contains(p)) {
        return Err(ValidationError::SuspiciousPath);
    }

    let mut cleaned = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(cleaned.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    cleaned.pop();
                } else if !cleaned.has_root() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    Ok(cleaned)
}

/// Rejects files writable by group/others or carrying setuid/setgid.
pub fn validate_file_permissions(path: &Path) -> Result<(), ValidationError> {
    let meta = std::fs::metadata(path).map_err(|e| ValidationError::Stat {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & 0o022 != 0 {
            return Err(ValidationError::Writable(path.display().to_string()));
        }
        if mode & 0o6000 != 0 {
            return Err(ValidationError::SetId(path.display().to_string()));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    Ok(())
}
