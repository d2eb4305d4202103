//! # Stowage
//!
//! Application lifecycle and secret handling for the stowage backup CLI.
//!
//! An invocation goes through:
//!
//! - **Bootstrap pipeline**: config, profiling, security, repository and
//!   signals stages mutating one shared context, with ordered cleanup
//! - **Repository unlock**: header validation and key recovery from a key
//!   file or up to three interactive passphrases
//! - **Command execution**: the resolved subcommand runs against the opened
//!   repository while an async reporter records its outcome
//! - **Secret handling**: the repository key lives in a locked, zeroized vault
//!   for the lifetime of the process
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stowage::prelude::*;
//!
//! let mut ctx = BootstrapContext::new("stowage", args);
//! let result = Pipeline::standard().run(&mut ctx).await;
//! // ...
//! ctx.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bootstrap;
pub mod cancellation;
pub mod commands;
pub mod config;
pub mod cookies;
pub mod errors;
pub mod logging;
pub mod reporting;
pub mod repository;
pub mod security;
pub mod services;
pub mod task;
pub mod updates;
pub mod utils;

#[cfg(test)]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bootstrap::{BootstrapContext, Pipeline, Stage};
    pub use crate::cancellation::{CancellationToken, CleanupRegistry, SignalHandler};
    pub use crate::commands::{Command, CommandContext, CommandFlags, CommandRegistry, Outcome};
    pub use crate::errors::{BootstrapError, CleanupError, CodedError, ErrorCode, SecretError};
    pub use crate::reporting::{Emitter, EmitterResolver, Reporter, ReporterConfig};
    pub use crate::repository::{KeyDerivation, PassphrasePrompt, Repository, Store, StoreBackend};
    pub use crate::security::{SecureString, SecurityContext};
    pub use crate::task::{dispatch, run_command, TaskReporting};
}
