//! Error types for the stowage bootstrap and runtime.
//!
//! Each subsystem has its own error type; [`BootstrapError`] is the one that
//! reaches the binary, wrapped with the failing stage's name by the pipeline.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The main error type for bootstrap and command dispatch.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A stage failed; carries the stage name.
    #[error("bootstrap stage \"{stage}\" failed: {source}")]
    Stage {
        /// Name of the failing stage.
        stage: String,
        /// The stage's own error.
        #[source]
        source: Box<BootstrapError>,
    },

    /// Command line flags could not be parsed.
    #[error("{0}")]
    FlagParse(String),

    /// A generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested CPU limit is zero or negative.
    #[error("invalid -cpu value {0}")]
    InvalidCpu(i64),

    /// The requested CPU limit exceeds the cores available.
    #[error("can't use more cores than available: {available}")]
    TooManyCpus {
        /// The value passed on the command line.
        requested: i64,
        /// Cores available to this process.
        available: usize,
    },

    /// No subcommand was given.
    #[error("a subcommand must be provided")]
    MissingSubcommand,

    /// The subcommand is unknown.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// A command that runs before repository open was used with `at`.
    #[error("{0} command cannot be used with 'at' parameter")]
    AtSyntaxNotAllowed(String),

    /// The backing store could not be opened.
    #[error("failed to open the repository at {location}: {message}")]
    RepositoryOpen {
        /// Location that was attempted.
        location: String,
        /// Underlying failure.
        message: String,
    },

    /// The store header could not be parsed.
    #[error("invalid repository configuration: {0}")]
    InvalidRepositoryConfig(String),

    /// The store's format version is not the one this binary supports.
    #[error("incompatible repository version: {found} != {expected}")]
    IncompatibleVersion {
        /// Version found in the store header.
        found: String,
        /// Version this binary supports.
        expected: String,
    },

    /// The repository key could not be recovered.
    #[error("failed to unlock repository")]
    CantUnlock,

    /// Reading the passphrase failed.
    #[error("could not read passphrase: {0}")]
    Passphrase(String),

    /// Repository construction failed after the store was opened.
    #[error("repository error: {0}")]
    Repository(String),

    /// Profiling could not be started or finalized.
    #[error("profiling error: {0}")]
    Profiling(String),

    /// The running agent does not match this binary.
    #[error("agent version mismatch: running {running}, expected {expected}")]
    WrongAgentVersion {
        /// Version reported by the agent.
        running: String,
        /// Version of this binary.
        expected: String,
    },

    /// A secret could not be stored or read.
    #[error("{0}")]
    Secret(#[from] SecretError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    /// Wraps this error with the name of the stage that produced it.
    #[must_use]
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through stage wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit status for this error: 2 for flag parsing, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Self::FlagParse(_) => 2,
            _ => 1,
        }
    }

    /// Returns a remediation hint for the user, if one applies.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::RepositoryOpen { .. } => Some(
                "To specify an alternative repository, please use \"stowage at <location> <command>\".",
            ),
            Self::WrongAgentVersion { .. } => {
                Some("To stop the current agent, run:\n\t$ stowage agent stop")
            }
            _ => None,
        }
    }
}

/// Errors raised by the secret vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecretError {
    /// A vault cannot hold an empty secret.
    #[error("cannot create a secure string from empty data")]
    Empty,

    /// The vault has been cleared.
    #[error("secure string has been cleared")]
    Cleared,
}

/// Aggregate of the fallible cleanup actions that failed.
#[derive(Debug, Error)]
#[error("{}", format_failures(.failures))]
pub struct CleanupError {
    /// `(action name, error message)` per failure, in execution order.
    pub failures: Vec<(String, String)>,
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, msg)| format!("{name}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A stable error category used by coded errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ErrorCode(pub &'static str);

impl ErrorCode {
    /// Used when no specific code applies.
    pub const UNKNOWN: Self = Self("unknown");

    /// Returns the code as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// An error tagged with a code and contextual key/values.
///
/// Used by the reporting and service layers, whose failures are observed and
/// logged rather than propagated to the command's exit status.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CodedError {
    /// Error category.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
    /// Contextual metadata.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Underlying cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CodedError {
    /// Creates a new coded error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Wraps a cause. An empty message reuses the cause's message.
    #[must_use]
    pub fn wrap<E>(code: ErrorCode, cause: E, message: impl Into<String>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut message = message.into();
        if message.is_empty() {
            message = cause.to_string();
        }
        Self {
            code,
            message,
            context: BTreeMap::new(),
            source: Some(Box::new(cause)),
        }
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Returns `[code] message` with the context appended.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = format!("[{}] {}", self.code, self.message);
        if let Some(ref source) = self.source {
            out.push_str(&format!(": {source}"));
        }
        if !self.context.is_empty() {
            let pairs: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            out.push_str(&format!(" ({})", pairs.join(", ")));
        }
        out
    }
}

/// Callback notified of every coded error routed through [`ErrorObservers`].
pub type ErrorObserver = Box<dyn Fn(&CodedError) + Send + Sync>;

/// Observer list owned by the component whose errors it watches.
#[derive(Default)]
pub struct ErrorObservers {
    observers: parking_lot::RwLock<Vec<ErrorObserver>>,
}

impl ErrorObservers {
    /// Creates an empty observer list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list with one observer logging each error at `warn` level.
    #[must_use]
    pub fn logging(component: &'static str) -> Self {
        let observers = Self::new();
        observers.register(move |e| {
            tracing::warn!(
                component,
                code = %e.code,
                context = ?e.context,
                "{} error: {}",
                component,
                e.format()
            );
        });
        observers
    }

    /// Adds an observer.
    pub fn register<F>(&self, observer: F)
    where
        F: Fn(&CodedError) + Send + Sync + 'static,
    {
        self.observers.write().push(Box::new(observer));
    }

    /// Notifies every observer and hands the error back.
    pub fn emit(&self, error: CodedError) -> CodedError {
        for observer in self.observers.read().iter() {
            observer(&error);
        }
        error
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Returns true when no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ErrorObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorObservers").field("len", &self.len()).finish()
    }
}
