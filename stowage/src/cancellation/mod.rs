//! Cancellation and cleanup utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - CleanupRegistry for ordered, exactly-once cleanup
//! - SignalHandler turning the first OS interrupt into a cancellation

mod cleanup;
mod signals;
mod token;

pub use cleanup::CleanupRegistry;
pub use signals::{Signal, SignalHandler};
pub use token::CancellationToken;
