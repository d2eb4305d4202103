//! Ordered stage execution.

use async_trait::async_trait;
use std::fmt::Debug;
use tracing::debug;

use super::config::ConfigStage;
use super::context::BootstrapContext;
use super::profiling::ProfilingStage;
use super::repository::RepositoryStage;
use super::security::SecurityStage;
use super::signals::SignalsStage;
use crate::errors::BootstrapError;

/// One step of the bootstrap.
///
/// A stage mutates the context and registers the cleanup of whatever it
/// acquires. Returning an error aborts the pipeline.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes the stage.
    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError>;
}

/// Stages run in order until one fails or requests an exit.
///
/// The pipeline performs no cleanup; callers close the context whatever the
/// outcome.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// config, profiling, security, repository, signals.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_stage(ConfigStage)
            .with_stage(ProfilingStage)
            .with_stage(SecurityStage)
            .with_stage(RepositoryStage)
            .with_stage(SignalsStage)
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs the stages.
    ///
    /// A set exit flag halts without error. A stage error is wrapped with the
    /// stage's name and returned.
    pub async fn run(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        for stage in &self.stages {
            if ctx.should_exit() {
                debug!(stage = stage.name(), exit_code = ctx.exit_code(), "bootstrap halted");
                return Ok(());
            }
            debug!(stage = stage.name(), "running bootstrap stage");
            stage.execute(ctx).await.map_err(|e| e.in_stage(stage.name()))?;
        }
        Ok(())
    }
}
