//! Repository handle and the collaborators needed to open it.
//!
//! This module provides:
//! - Store access (`storage`) with a filesystem backend
//! - The key derivation seam (`encryption`)
//! - Passphrase prompting (`passphrase`)
//! - The unlock protocol (`unlock`)
//! - `Repository`, the opened handle commands run against

pub mod encryption;
pub mod passphrase;
pub mod storage;
pub mod unlock;

pub use encryption::{Argon2Kdf, EncryptionConfig, EncryptionError, KdfParams, KeyDerivation};
pub use passphrase::{PassphrasePrompt, TerminalPrompt};
pub use storage::{
    DefaultBackend, FsStore, StorageConfiguration, StorageError, Store, StoreBackend, STORAGE_VERSION,
};
pub use unlock::{setup_encryption, MAX_PASSPHRASE_ATTEMPTS};

use crate::config::StoreConfig;
use crate::security::SecureString;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors raised by the repository handle.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The handle has been closed.
    #[error("repository is closed")]
    Closed,

    /// The handle has no backing store.
    #[error("repository does not exist yet")]
    Inexistent,

    /// An encrypted repository was opened without its key.
    #[error("repository is encrypted but no key was provided")]
    MissingSecret,

    /// The local state cache could not be maintained.
    #[error("state cache error: {0}")]
    Cache(#[source] std::io::Error),

    /// Store error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How the local state cache is treated on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Validate the cache and rebuild it when stale (agentless execution).
    Rebuild,
    /// Trust the cache; a running agent keeps it current.
    NoRebuild,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheState {
    repository_id: Uuid,
    version: String,
    rebuilt_at: DateTime<Utc>,
}

/// An opened repository, or a placeholder for one about to be created.
pub struct Repository {
    store: Option<Arc<dyn Store>>,
    configuration: Option<StorageConfiguration>,
    store_config: StoreConfig,
    secret: Mutex<Option<SecureString>>,
    cache_dir: Option<PathBuf>,
    rebuilt: bool,
    closed: AtomicBool,
}

impl Repository {
    /// Builds the handle over an opened store.
    ///
    /// `secret` is copied into a vault owned by the handle.
    pub fn open(
        store: Arc<dyn Store>,
        serialized_config: &[u8],
        store_config: StoreConfig,
        secret: Option<&[u8]>,
        cache_root: &Path,
        mode: OpenMode,
    ) -> Result<Self, RepositoryError> {
        let configuration = StorageConfiguration::from_bytes(serialized_config)?;

        let secret = secret.and_then(|s| SecureString::new(s).ok());
        if configuration.is_encrypted() && secret.is_none() {
            return Err(RepositoryError::MissingSecret);
        }

        let cache_dir = cache_root
            .join("repository")
            .join(configuration.repository_id.to_string());

        let rebuilt = match mode {
            OpenMode::Rebuild => rebuild_state(&cache_dir, &configuration)?,
            OpenMode::NoRebuild => false,
        };

        debug!(
            location = %store.location(),
            repository_id = %configuration.repository_id,
            ?mode,
            rebuilt,
            "repository opened"
        );

        Ok(Self {
            store: Some(store),
            configuration: Some(configuration),
            store_config,
            secret: Mutex::new(secret),
            cache_dir: Some(cache_dir),
            rebuilt,
            closed: AtomicBool::new(false),
        })
    }

    /// Placeholder for commands that create the repository themselves.
    #[must_use]
    pub fn inexistent(store_config: StoreConfig) -> Self {
        Self {
            store: None,
            configuration: None,
            store_config,
            secret: Mutex::new(None),
            cache_dir: None,
            rebuilt: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Location of the repository.
    #[must_use]
    pub fn location(&self) -> String {
        self.store.as_ref().map_or_else(
            || self.store_config.get("location").cloned().unwrap_or_default(),
            |s| s.location(),
        )
    }

    /// Parsed store header, absent for placeholders.
    #[must_use]
    pub fn configuration(&self) -> Option<&StorageConfiguration> {
        self.configuration.as_ref()
    }

    /// The store configuration the handle was built from.
    #[must_use]
    pub fn store_config(&self) -> &StoreConfig {
        &self.store_config
    }

    /// The backing store, absent for placeholders.
    pub fn store(&self) -> Result<&Arc<dyn Store>, RepositoryError> {
        if self.is_closed() {
            return Err(RepositoryError::Closed);
        }
        self.store.as_ref().ok_or(RepositoryError::Inexistent)
    }

    /// Returns whether the handle holds a key.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret.lock().as_ref().is_some_and(|s| !s.is_cleared())
    }

    /// Returns whether the open rebuilt the local state cache.
    #[must_use]
    pub fn state_rebuilt(&self) -> bool {
        self.rebuilt
    }

    /// Local state cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Releases the handle and clears its key. Idempotent.
    ///
    /// The store itself is closed by its owner.
    pub fn close(&self) -> Result<(), RepositoryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(secret) = self.secret.lock().take() {
            secret.clear();
        }
        debug!(location = %self.location(), "repository closed");
        Ok(())
    }

    /// Returns whether the handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("location", &self.location())
            .field("configuration", &self.configuration)
            .field("has_secret", &self.has_secret())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Validates the local state cache, rewriting it when stale. Returns true if rewritten.
fn rebuild_state(dir: &Path, configuration: &StorageConfiguration) -> Result<bool, RepositoryError> {
    let path = dir.join("state.json");
    let current = fs::read(&path)
        .ok()
        .and_then(|data| serde_json::from_slice::<CacheState>(&data).ok());

    if let Some(state) = current {
        if state.repository_id == configuration.repository_id && state.version == configuration.version {
            return Ok(false);
        }
    }

    fs::create_dir_all(dir).map_err(RepositoryError::Cache)?;
    let state = CacheState {
        repository_id: configuration.repository_id,
        version: configuration.version.clone(),
        rebuilt_at: Utc::now(),
    };
    let data = serde_json::to_vec(&state)
        .map_err(|e| RepositoryError::Cache(std::io::Error::other(e)))?;
    fs::write(&path, data).map_err(RepositoryError::Cache)?;
    info!(repository_id = %configuration.repository_id, "rebuilt local state cache");
    Ok(true)
}
