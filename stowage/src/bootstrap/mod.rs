//! Bootstrap pipeline.
//!
//! This module provides:
//! - `BootstrapContext`, the per-invocation state and cleanup registry
//! - `Pipeline`, running named stages in order with early exit
//! - The five standard stages: config, profiling, security, repository, signals

mod config;
mod context;
#[cfg(test)]
mod integration_tests;
mod pipeline;
mod profiling;
mod repository;
mod security;
mod signals;

pub use config::{cpu_limits, ConfigStage};
pub use context::{BootstrapContext, Settings, Target};
pub use pipeline::{Pipeline, Stage};
pub use profiling::{Profiler, ProfilingStage, SAMPLE_INTERVAL};
pub use repository::RepositoryStage;
pub use security::SecurityStage;
pub use signals::SignalsStage;
