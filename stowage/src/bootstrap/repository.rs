//! Repository stage: opens and unlocks the target repository.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::BootstrapContext;
use super::pipeline::Stage;
use crate::commands::CommandFlags;
use crate::errors::BootstrapError;
use crate::repository::{setup_encryption, OpenMode, Repository, StorageConfiguration, STORAGE_VERSION};

/// Opens the store, checks its header and recovers the key.
///
/// Commands flagged `BEFORE_REPOSITORY_OPEN` get nothing, and those flagged
/// `BEFORE_REPOSITORY_WITH_STORAGE` get a placeholder to create into.
#[derive(Debug, Default, Clone, Copy)]
pub struct RepositoryStage;

#[async_trait]
impl Stage for RepositoryStage {
    fn name(&self) -> &str {
        "repository"
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        let (flags, name) = match &ctx.target.command {
            Some(resolved) => (resolved.command.flags(), resolved.name.join(" ")),
            None => (CommandFlags::NONE, String::new()),
        };

        if flags.contains(CommandFlags::BEFORE_REPOSITORY_OPEN) {
            if ctx.target.at_syntax {
                return Err(BootstrapError::AtSyntaxNotAllowed(name));
            }
            return Ok(());
        }

        if flags.contains(CommandFlags::BEFORE_REPOSITORY_WITH_STORAGE) {
            let placeholder = Arc::new(Repository::inexistent(ctx.target.store_config.clone()));
            let registered = placeholder.clone();
            ctx.cleanup().register_infallible("close repository", move || {
                let _ = registered.close();
            });
            ctx.repository = Some(placeholder);
            return Ok(());
        }

        let location = ctx.target.store_config.get("location").cloned().unwrap_or_default();
        let (store, header) = ctx
            .backend
            .open(&ctx.target.store_config)
            .map_err(|e| BootstrapError::RepositoryOpen {
                location: location.clone(),
                message: e.to_string(),
            })?;

        let registered = store.clone();
        ctx.cleanup().register("close store", move || {
            registered.close().map_err(|e| {
                warn!(error = %e, "could not close store");
                anyhow::Error::new(e)
            })
        });
        ctx.store = Some(store.clone());

        let configuration = StorageConfiguration::from_bytes(&header)
            .map_err(|e| BootstrapError::InvalidRepositoryConfig(e.to_string()))?;
        if configuration.version != STORAGE_VERSION {
            return Err(BootstrapError::IncompatibleVersion {
                found: configuration.version,
                expected: STORAGE_VERSION.to_string(),
            });
        }

        let key_from_file = ctx.security.key_from_file();
        setup_encryption(
            &configuration,
            key_from_file.as_deref().map(String::as_str),
            ctx.kdf.as_ref(),
            ctx.prompt.as_ref(),
            &ctx.security,
        )?;

        let mode = if ctx.settings.agentless {
            OpenMode::Rebuild
        } else {
            OpenMode::NoRebuild
        };
        let secret = ctx.security.secret();
        let repository = Repository::open(
            store,
            &header,
            ctx.target.store_config.clone(),
            secret.as_deref().map(Vec::as_slice),
            &ctx.settings.cache_dir,
            mode,
        )
        .map_err(|e| BootstrapError::Repository(e.to_string()))?;
        let repository = Arc::new(repository);

        let registered = repository.clone();
        ctx.cleanup().register("close repository", move || {
            registered.close().map_err(anyhow::Error::new)
        });
        debug!(
            location = %location,
            encrypted = configuration.is_encrypted(),
            ?mode,
            "repository ready"
        );
        ctx.repository = Some(repository);
        Ok(())
    }
}
