//! Subcommands and their registry.
//!
//! A command is looked up from the words following the global options (and
//! the optional `at REPOSITORY`), parsed from the remaining arguments, then
//! executed against the repository opened by the bootstrap pipeline.

mod builtin;
mod service;

pub use builtin::{Check, Create, Info, Version};
pub use service::{ServiceAdd, ServiceRm, ServiceShow};

use crate::cancellation::CancellationToken;
use crate::config::{HostInfo, StoreConfig};
use crate::cookies::CookieManager;
use crate::repository::{KeyDerivation, PassphrasePrompt, Repository, StoreBackend};
use crate::security::SecurityContext;
use crate::utils::Console;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::path::Path;

/// Requirements a command places on the bootstrap pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommandFlags(u32);

impl CommandFlags {
    /// Needs an opened repository.
    pub const NONE: Self = Self(0);
    /// Runs without any repository; `at` is rejected.
    pub const BEFORE_REPOSITORY_OPEN: Self = Self(1);
    /// Needs a placeholder for a repository it creates itself.
    pub const BEFORE_REPOSITORY_WITH_STORAGE: Self = Self(1 << 1);
    /// May be dispatched to a running agent.
    pub const AGENT_SUPPORT: Self = Self(1 << 2);

    /// Returns whether every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for CommandFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Result of a command run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Process exit status.
    pub status: i32,
    /// Non-fatal problem worth reporting.
    pub warning: Option<String>,
    /// Summary of a snapshot the command produced.
    pub snapshot: Option<serde_json::Value>,
}

impl Outcome {
    /// Successful run.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// Run ending with `status`.
    #[must_use]
    pub fn status(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Attaches a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

/// What a running command may use.
pub struct CommandContext<'a> {
    /// User-facing output.
    pub console: &'a Console,
    /// Owner of the repository key and the non-interactive passphrase.
    pub security: &'a SecurityContext,
    /// Set when the user interrupts.
    pub cancel: &'a CancellationToken,
    /// Host identity.
    pub host: &'a HostInfo,
    /// Working directory of the invocation.
    pub cwd: &'a Path,
    /// Full command line, for reports and logs.
    pub command_line: &'a str,
    /// Resolved store configuration.
    pub store_config: &'a StoreConfig,
    /// Store opener.
    pub backend: &'a dyn StoreBackend,
    /// Key derivation.
    pub kdf: &'a dyn KeyDerivation,
    /// Interactive passphrase source.
    pub prompt: &'a dyn PassphrasePrompt,
    /// Persisted markers, holding the account token once logged in.
    pub cookies: Option<&'a CookieManager>,
    /// Account services API endpoint.
    pub services_endpoint: &'a str,
}

impl fmt::Debug for CommandContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("cwd", &self.cwd)
            .field("command_line", &self.command_line)
            .finish_non_exhaustive()
    }
}

/// A subcommand.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
    /// Pipeline requirements.
    fn flags(&self) -> CommandFlags {
        CommandFlags::NONE
    }

    /// Report task kind; commands without one are not reported.
    fn task_kind(&self) -> Option<&'static str> {
        None
    }

    /// Parses the command's own arguments.
    fn parse(&mut self, args: &[String]) -> anyhow::Result<()>;

    /// Runs the command.
    async fn execute(
        &self,
        ctx: &CommandContext<'_>,
        repository: Option<&Repository>,
    ) -> anyhow::Result<Outcome>;
}

/// Builds a fresh command instance.
pub type CommandFactory = fn() -> Box<dyn Command>;

/// A command found by [`CommandRegistry::lookup`].
#[derive(Debug)]
pub struct ResolvedCommand {
    /// Fresh, unparsed instance.
    pub command: Box<dyn Command>,
    /// Words naming the command (`["agent", "stop"]`).
    pub name: Vec<String>,
    /// Arguments following the name.
    pub args: Vec<String>,
}

/// Known commands, keyed by their word sequence.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    entries: BTreeMap<Vec<&'static str>, CommandFactory>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in commands.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(&["check"], || Box::new(Check::default()));
        registry.register(&["create"], || Box::new(Create::default()));
        registry.register(&["info"], || Box::new(Info::default()));
        registry.register(&["service", "add"], || Box::new(ServiceAdd::default()));
        registry.register(&["service", "rm"], || Box::new(ServiceRm::default()));
        registry.register(&["service", "show"], || Box::new(ServiceShow::default()));
        registry.register(&["version"], || Box::new(Version));
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &[&'static str], factory: CommandFactory) {
        self.entries.insert(name.to_vec(), factory);
    }

    /// Finds the command with the longest name prefixing `args`.
    #[must_use]
    pub fn lookup(&self, args: &[String]) -> Option<ResolvedCommand> {
        let (name, factory) = self
            .entries
            .iter()
            .filter(|(name, _)| {
                name.len() <= args.len() && name.iter().zip(args).all(|(word, arg)| *word == arg.as_str())
            })
            .max_by_key(|(name, _)| name.len())?;

        Some(ResolvedCommand {
            command: factory(),
            name: name.iter().map(|w| (*w).to_string()).collect(),
            args: args[name.len()..].to_vec(),
        })
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<Vec<&'static str>> {
        self.entries.keys().cloned().collect()
    }

    /// One line per top-level command; subcommands are listed inline as
    /// `name a | b`, or `name [a | b]` when the bare name is a command too.
    #[must_use]
    pub fn usage(&self, prefix: &str) -> String {
        let mut groups: BTreeMap<&str, (bool, Vec<&str>)> = BTreeMap::new();
        for name in self.entries.keys() {
            let Some(first) = name.first() else { continue };
            let group = groups.entry(*first).or_default();
            match name.get(1) {
                Some(sub) if !group.1.contains(sub) => group.1.push(*sub),
                Some(_) => {}
                None => group.0 = true,
            }
        }

        let mut out = String::new();
        for (name, (bare, subs)) in groups {
            let line = match (bare, subs.is_empty()) {
                (_, true) => name.to_string(),
                (true, false) => format!("{name} [{}]", subs.join(" | ")),
                (false, false) => format!("{name} {}", subs.join(" | ")),
            };
            out.push_str(prefix);
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}
