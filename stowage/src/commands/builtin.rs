//! Built-in commands.

use super::{Command, CommandContext, CommandFlags, Outcome};
use crate::config::normalize_args;
use crate::repository::{EncryptionConfig, KdfParams, Repository, StorageConfiguration};
use crate::utils::client_name;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;

pub(super) fn parse_with<P: Parser>(name: &str, args: &[String]) -> anyhow::Result<P> {
    let argv = std::iter::once(name.to_string()).chain(normalize_args(args));
    P::try_parse_from(argv).map_err(|e| anyhow!(e.render().to_string().trim_end().to_string()))
}

fn require(repository: Option<&Repository>) -> anyhow::Result<&Repository> {
    repository.ok_or_else(|| anyhow!("no repository opened"))
}

#[derive(Debug, Parser)]
#[command(name = "version", about = "Print the version")]
struct NoArgs {}

/// `version`: prints the client version.
#[derive(Debug, Default, Clone, Copy)]
pub struct Version;

#[async_trait]
impl Command for Version {
    fn flags(&self) -> CommandFlags {
        CommandFlags::BEFORE_REPOSITORY_OPEN
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        parse_with::<NoArgs>("version", args)?;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, _repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        ctx.console.println(client_name());
        Ok(Outcome::ok())
    }
}

#[derive(Debug, Parser)]
#[command(name = "create", about = "Create a new repository")]
struct CreateArgs {
    /// Disable encryption
    #[arg(long)]
    plaintext: bool,
}

/// `create`: initializes a repository at the resolved location.
///
/// The passphrase comes from the non-interactive sources when one is set,
/// otherwise it is read twice from the terminal.
#[derive(Debug, Clone)]
pub struct Create {
    plaintext: bool,
    kdf_params: KdfParams,
}

impl Default for Create {
    fn default() -> Self {
        Self {
            plaintext: false,
            kdf_params: KdfParams::argon2id(),
        }
    }
}

impl Create {
    /// Uses `params` for the new repository's key derivation.
    #[must_use]
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }
}

#[async_trait]
impl Command for Create {
    fn flags(&self) -> CommandFlags {
        CommandFlags::BEFORE_REPOSITORY_WITH_STORAGE
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        let parsed: CreateArgs = parse_with("create", args)?;
        self.plaintext = parsed.plaintext;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        let repository = require(repository)?;

        let encryption = if self.plaintext {
            None
        } else {
            let passphrase = match ctx.security.key_from_file() {
                Some(key) => key,
                None => ctx.prompt.read_new_passphrase("repository")?,
            };
            let (config, _key) = EncryptionConfig::generate(ctx.kdf, self.kdf_params.clone(), passphrase.as_bytes())
                .context("could not set up encryption")?;
            Some(config)
        };

        let header = StorageConfiguration::new(encryption);
        let store = ctx
            .backend
            .create(repository.store_config(), &header.to_bytes()?)
            .with_context(|| format!("could not create repository at {}", repository.location()))?;
        let location = store.location();
        store.close()?;

        info!(
            location = %location,
            repository_id = %header.repository_id,
            encrypted = header.is_encrypted(),
            "repository created"
        );
        Ok(Outcome::ok())
    }
}

/// `info`: prints the repository header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Info;

#[async_trait]
impl Command for Info {
    fn flags(&self) -> CommandFlags {
        CommandFlags::AGENT_SUPPORT
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        parse_with::<NoArgs>("info", args)?;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        let repository = require(repository)?;
        let config = repository
            .configuration()
            .ok_or_else(|| anyhow!("repository has no configuration"))?;

        ctx.console.println(format!("Location: {}", repository.location()));
        ctx.console.println(format!("RepositoryID: {}", config.repository_id));
        ctx.console.println(format!("Version: {}", config.version));
        ctx.console.println(format!("Timestamp: {}", config.timestamp.to_rfc3339()));
        match &config.encryption {
            Some(encryption) => ctx.console.println(format!(
                "Encryption: {} (m={}KiB, t={}, p={})",
                encryption.kdf.algorithm,
                encryption.kdf.memory_kib,
                encryption.kdf.iterations,
                encryption.kdf.parallelism
            )),
            None => ctx.console.println("Encryption: none"),
        }
        Ok(Outcome::ok())
    }
}

/// `check`: verifies the store header and layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct Check;

#[async_trait]
impl Command for Check {
    fn flags(&self) -> CommandFlags {
        CommandFlags::AGENT_SUPPORT
    }

    fn task_kind(&self) -> Option<&'static str> {
        Some("check")
    }

    fn parse(&mut self, args: &[String]) -> anyhow::Result<()> {
        parse_with::<NoArgs>("check", args)?;
        Ok(())
    }

    async fn execute(&self, ctx: &CommandContext<'_>, repository: Option<&Repository>) -> anyhow::Result<Outcome> {
        let repository = require(repository)?;
        if ctx.cancel.is_cancelled() {
            bail!("check interrupted");
        }

        let store = repository.store()?;
        let stored = StorageConfiguration::from_bytes(&store.read_configuration()?)?;
        if Some(&stored) != repository.configuration() {
            bail!("repository configuration changed since it was opened");
        }

        let problems = store.verify()?;
        if problems.is_empty() {
            ctx.console.println(format!("check: {} ok", repository.location()));
            return Ok(Outcome::ok());
        }
        for problem in &problems {
            ctx.console.eprintln(format!("check: {problem}"));
        }
        Ok(Outcome::ok().with_warning(problems.join(", ")))
    }
}
