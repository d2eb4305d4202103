//! Shared state threaded through the bootstrap stages.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cancellation::{CancellationToken, CleanupRegistry, SignalHandler};
use crate::commands::{CommandContext, CommandRegistry, ResolvedCommand};
use crate::config::{Config, Directories, EnvOverrides, GlobalArgs, HostInfo, StoreConfig};
use crate::cookies::CookieManager;
use crate::errors::{BootstrapError, CleanupError};
use crate::repository::{
    Argon2Kdf, DefaultBackend, KeyDerivation, PassphrasePrompt, Repository, Store, StoreBackend, TerminalPrompt,
};
use crate::security::SecurityContext;
use crate::services::SERVICE_ENDPOINT;
use crate::updates::UpdateChecker;
use crate::utils::Console;

use super::profiling::Profiler;

/// What the invocation targets.
#[derive(Debug, Default)]
pub struct Target {
    /// Repository reference as given (`@name`, a location, or the fallback).
    pub repository: String,
    /// `at <repository>` was used.
    pub at_syntax: bool,
    /// Resolved store configuration, passphrase keys removed.
    pub store_config: StoreConfig,
    /// Resolved subcommand, not yet parsed.
    pub command: Option<ResolvedCommand>,
}

/// Process-level settings derived by the configuration stage.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Configuration directory.
    pub config_dir: PathBuf,
    /// Cache directory for the execution mode.
    pub cache_dir: PathBuf,
    /// Cores the process may use.
    pub cpu: usize,
    /// `2 * cpu + 1`.
    pub max_concurrency: usize,
    /// Commands run in this process rather than through the agent.
    pub agentless: bool,
    /// The user opted out of the update check.
    pub security_check_disabled: bool,
}

/// One invocation's state.
///
/// Collaborators default to the real implementations and may be replaced
/// before the pipeline runs.
pub struct BootstrapContext {
    /// Program name, for error prefixes.
    pub program: String,
    /// Arguments following the program name.
    pub args: Vec<String>,
    /// Working directory at startup.
    pub cwd: PathBuf,
    /// Process id.
    pub pid: u32,
    /// Full command line.
    pub command_line: String,

    /// Parsed global options.
    pub options: GlobalArgs,
    /// Loaded configuration file.
    pub config: Config,
    /// Derived settings.
    pub settings: Settings,
    /// Resolved target.
    pub target: Target,

    /// Environment captured at startup.
    pub env: EnvOverrides,
    /// Host identity, detected by the configuration stage unless injected.
    pub host: Option<HostInfo>,
    /// Base directories, detected by the configuration stage unless injected.
    pub dirs: Option<Directories>,
    /// Persisted markers.
    pub cookies: Option<CookieManager>,

    /// Owner of the repository key.
    pub security: Arc<SecurityContext>,
    /// Fired on the first interrupt.
    pub cancel: Arc<CancellationToken>,
    /// Opened store, absent before the repository stage.
    pub store: Option<Arc<dyn Store>>,
    /// Opened repository or creation placeholder.
    pub repository: Option<Arc<Repository>>,
    /// Running profiler.
    pub profiler: Option<Arc<Profiler>>,
    /// Installed signal handler.
    pub signals: Option<Arc<SignalHandler>>,

    /// Known commands.
    pub registry: CommandRegistry,
    /// User-facing output.
    pub console: Arc<Console>,
    /// Store opener.
    pub backend: Arc<dyn StoreBackend>,
    /// Key derivation.
    pub kdf: Arc<dyn KeyDerivation>,
    /// Interactive passphrase source.
    pub prompt: Arc<dyn PassphrasePrompt>,
    /// Update checker; the HTTP feed in the cache directory when unset.
    pub update_checker: Option<Arc<dyn UpdateChecker>>,
    /// Account services API endpoint.
    pub services_endpoint: String,
    /// Install OS signal handlers, or a detached handler when false.
    pub os_signals: bool,

    exit_code: Option<i32>,
    cleanup: CleanupRegistry,
}

impl BootstrapContext {
    /// Creates the context for `program args...`.
    ///
    /// Clearing the security context is registered first, so it is the last
    /// cleanup to run.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let command_line = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let security = Arc::new(SecurityContext::new());
        let cleanup = CleanupRegistry::new();
        let vault = security.clone();
        cleanup.register_infallible("clear secrets", move || vault.clear());

        Self {
            program,
            args,
            cwd: std::env::current_dir().unwrap_or_default(),
            pid: std::process::id(),
            command_line,
            options: GlobalArgs::default(),
            config: Config::default(),
            settings: Settings::default(),
            target: Target::default(),
            env: EnvOverrides::from_process(),
            host: None,
            dirs: None,
            cookies: None,
            security,
            cancel: Arc::new(CancellationToken::new()),
            store: None,
            repository: None,
            profiler: None,
            signals: None,
            registry: CommandRegistry::builtin(),
            console: Arc::new(Console::stdio()),
            backend: Arc::new(DefaultBackend),
            kdf: Arc::new(Argon2Kdf),
            prompt: Arc::new(TerminalPrompt),
            update_checker: None,
            services_endpoint: SERVICE_ENDPOINT.to_string(),
            os_signals: true,
            exit_code: None,
            cleanup,
        }
    }

    /// Replaces the captured environment.
    #[must_use]
    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.env = env;
        self
    }

    /// Uses `dirs` instead of the platform directories.
    #[must_use]
    pub fn with_directories(mut self, dirs: Directories) -> Self {
        self.dirs = Some(dirs);
        self
    }

    /// Uses `host` instead of detecting it.
    #[must_use]
    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = Some(host);
        self
    }

    /// Replaces the console.
    #[must_use]
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = Arc::new(console);
        self
    }

    /// Replaces the store opener.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn StoreBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replaces the key derivation.
    #[must_use]
    pub fn with_kdf(mut self, kdf: Arc<dyn KeyDerivation>) -> Self {
        self.kdf = kdf;
        self
    }

    /// Replaces the passphrase prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn PassphrasePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Replaces the update checker.
    #[must_use]
    pub fn with_update_checker(mut self, checker: Arc<dyn UpdateChecker>) -> Self {
        self.update_checker = Some(checker);
        self
    }

    /// Points account service calls at `endpoint`.
    #[must_use]
    pub fn with_services_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.services_endpoint = endpoint.into();
        self
    }

    /// Replaces the command registry.
    #[must_use]
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Leaves OS signal dispositions alone.
    #[must_use]
    pub fn without_os_signals(mut self) -> Self {
        self.os_signals = false;
        self
    }

    /// Requests a clean halt of the pipeline with `code`.
    pub fn exit_with(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// Returns whether a stage requested a halt.
    #[must_use]
    pub fn should_exit(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Exit code requested by a stage, 0 when none was.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(0)
    }

    /// Cleanup actions run by [`BootstrapContext::close`].
    #[must_use]
    pub fn cleanup(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    /// Runs every registered cleanup action.
    pub fn close(&self) -> Result<(), CleanupError> {
        self.cleanup.close()
    }

    /// Borrows what a command needs to run.
    pub fn command_context(&self) -> Result<CommandContext<'_>, BootstrapError> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| BootstrapError::Config("host identity not resolved".into()))?;
        Ok(CommandContext {
            console: &self.console,
            security: &self.security,
            cancel: &self.cancel,
            host,
            cwd: &self.cwd,
            command_line: &self.command_line,
            store_config: &self.target.store_config,
            backend: self.backend.as_ref(),
            kdf: self.kdf.as_ref(),
            prompt: self.prompt.as_ref(),
            cookies: self.cookies.as_ref(),
            services_endpoint: &self.services_endpoint,
        })
    }
}

impl std::fmt::Debug for BootstrapContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapContext")
            .field("program", &self.program)
            .field("command_line", &self.command_line)
            .field("target", &self.target)
            .field("settings", &self.settings)
            .field("exit_code", &self.exit_code)
            .field("pending_cleanups", &self.cleanup.pending_count())
            .finish_non_exhaustive()
    }
}
