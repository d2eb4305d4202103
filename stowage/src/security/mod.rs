//! Secret handling.
//!
//! This module provides:
//! - `SecureString`, a single-secret vault with constant-time comparison
//! - `SecurityContext`, the per-invocation owner of the repository key
//! - Platform memory locking backends
//! - Path and file permission validation

mod context;
pub mod memlock;
mod secure_string;
pub mod validation;

pub use context::SecurityContext;
pub use memlock::{platform_locker, MemoryLocker, NoopLocker};
pub use secure_string::SecureString;
pub use validation::{sanitize_path, validate_file_permissions, ValidationError};
