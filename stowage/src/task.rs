//! Command execution with task reporting.
//!
//! [`run_command`] wraps one command run in a report: the task starts before
//! the command executes, ends with its outcome, and the reporter is drained
//! before the function returns. [`dispatch`] runs the command resolved by the
//! bootstrap pipeline, after [`AgentProbe`] has checked any running agent.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bootstrap::BootstrapContext;
use crate::cancellation::CancellationToken;
use crate::commands::{CommandContext, CommandFlags, ResolvedCommand};
use crate::errors::BootstrapError;
use crate::reporting::{EmitterResolver, Reporter, ReporterConfig};
use crate::repository::Repository;
use crate::utils::VERSION;

/// Error code recorded for a command that failed with an error.
pub const FAILURE_CODE: u32 = 1;

/// How task reports are delivered.
#[derive(Clone)]
pub struct TaskReporting {
    /// Reporter tuning.
    pub config: ReporterConfig,
    /// Emitter selection.
    pub resolver: Arc<dyn EmitterResolver>,
    /// Drains the reporter early when fired.
    pub cancel: Arc<CancellationToken>,
}

impl TaskReporting {
    /// Default tuning.
    pub fn new(resolver: Arc<dyn EmitterResolver>, cancel: Arc<CancellationToken>) -> Self {
        Self {
            config: ReporterConfig::default(),
            resolver,
            cancel,
        }
    }

    /// Replaces the reporter tuning.
    #[must_use]
    pub fn with_config(mut self, config: ReporterConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for TaskReporting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReporting")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Runs a parsed command and reports its outcome.
///
/// Commands without a task kind still go through the reporter, with the
/// report marked ignored. Returns the command's exit status.
pub async fn run_command(
    ctx: &CommandContext<'_>,
    resolved: &ResolvedCommand,
    repository: Option<&Repository>,
    repository_name: &str,
    reporting: &TaskReporting,
) -> anyhow::Result<i32> {
    let reporter = Reporter::new(
        reporting.config.clone(),
        reporting.resolver.clone(),
        reporting.cancel.clone(),
    );
    let name = resolved.name.join(" ");

    let mut report = reporter.new_report();
    match resolved.command.task_kind() {
        Some(kind) => report.task_start(kind, name.as_str()),
        None => report.set_ignore(),
    }
    report.with_repository_name(repository_name);
    if let Some(repository) = repository {
        if repository.configuration().is_some() {
            report.with_repository(repository);
        }
        report.with_store_config(repository.store_config());
    }

    debug!(command = %name, "executing command");
    let result = resolved.command.execute(ctx, repository).await;
    match &result {
        Ok(outcome) => {
            if let Some(snapshot) = outcome.snapshot.clone() {
                report.with_snapshot(snapshot);
            }
            if outcome.status != 0 {
                let code = u32::try_from(outcome.status).unwrap_or(FAILURE_CODE);
                report.task_failed(code, String::new()).await;
            } else if let Some(warning) = &outcome.warning {
                report.task_warning(warning.as_str()).await;
            } else {
                report.task_done().await;
            }
        }
        Err(e) => report.task_failed(FAILURE_CODE, e.to_string()).await,
    }

    reporter.stop_and_wait().await;
    result.map(|outcome| outcome.status)
}

/// Parses and runs the command resolved by the bootstrap pipeline.
///
/// Agent-capable commands outside agentless mode first check that a running
/// agent matches this binary. Returns the command's exit status.
pub async fn dispatch(ctx: &mut BootstrapContext, reporting: &TaskReporting) -> anyhow::Result<i32> {
    let mut resolved = ctx.target.command.take().ok_or(BootstrapError::MissingSubcommand)?;
    resolved.command.parse(&resolved.args)?;

    if !ctx.settings.agentless && resolved.command.flags().contains(CommandFlags::AGENT_SUPPORT) {
        let probe = AgentProbe::new(&ctx.settings.cache_dir);
        if probe.ensure_compatible(VERSION)? {
            debug!("agent running, executing in-process");
        }
    }

    let repository = ctx.repository.clone();
    let command_ctx = ctx.command_context()?;
    run_command(
        &command_ctx,
        &resolved,
        repository.as_deref(),
        &ctx.target.repository,
        reporting,
    )
    .await
}

/// Version stamp of a running agent.
#[derive(Debug, Clone)]
pub struct AgentProbe {
    stamp: PathBuf,
}

impl AgentProbe {
    /// Probes the agent owning `cache_dir`.
    #[must_use]
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            stamp: cache_dir.join("agent").join("version"),
        }
    }

    /// Path of the version stamp.
    #[must_use]
    pub fn stamp(&self) -> &Path {
        &self.stamp
    }

    /// Version of the running agent, `None` when no agent is running.
    pub fn running_version(&self) -> Result<Option<String>, BootstrapError> {
        match std::fs::read_to_string(&self.stamp) {
            Ok(version) => Ok(Some(version.trim().to_string()).filter(|v| !v.is_empty())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fails with `WrongAgentVersion` when a running agent is not `expected`.
    ///
    /// Returns whether an agent is running.
    pub fn ensure_compatible(&self, expected: &str) -> Result<bool, BootstrapError> {
        match self.running_version()? {
            Some(running) if running != expected => {
                warn!(%running, %expected, "agent version mismatch");
                Err(BootstrapError::WrongAgentVersion {
                    running,
                    expected: expected.to_string(),
                })
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }
}
