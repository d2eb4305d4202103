//! Backing store access.

use super::encryption::EncryptionConfig;
use crate::config::StoreConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// The one store format version this binary reads and writes.
pub const STORAGE_VERSION: &str = "1.0.0";

/// Name of the self-describing header inside a filesystem store.
pub const CONFIG_FILENAME: &str = "CONFIG";

const LAYOUT_DIRS: [&str; 3] = ["packfiles", "states", "locks"];

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No backend handles the location's scheme.
    #[error("unsupported storage location: {0}")]
    UnsupportedBackend(String),

    /// The store configuration has no `location`.
    #[error("missing location")]
    MissingLocation,

    /// Nothing exists at the location.
    #[error("repository does not exist: {0}")]
    NotFound(String),

    /// A repository already exists at the location.
    #[error("repository already exists: {0}")]
    AlreadyExists(String),

    /// The header could not be decoded.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// IO error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Self-describing store header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfiguration {
    /// Format version.
    pub version: String,
    /// Stable repository identifier.
    pub repository_id: Uuid,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Encryption parameters; absent for plaintext repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionConfig>,
}

impl StorageConfiguration {
    /// Creates a header for a new repository at the current version.
    #[must_use]
    pub fn new(encryption: Option<EncryptionConfig>) -> Self {
        Self {
            version: STORAGE_VERSION.to_string(),
            repository_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            encryption,
        }
    }

    /// Decodes a serialized header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(data).map_err(|e| StorageError::InvalidConfiguration(e.to_string()))
    }

    /// Encodes the header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| StorageError::InvalidConfiguration(e.to_string()))
    }

    /// Returns whether the repository is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// An opened backing store.
pub trait Store: Send + Sync + fmt::Debug {
    /// Location string the store was opened from.
    fn location(&self) -> String;

    /// Reads the serialized header.
    fn read_configuration(&self) -> Result<Vec<u8>, StorageError>;

    /// Releases the store. Closing twice is not an error.
    fn close(&self) -> Result<(), StorageError>;

    /// Returns whether the store has been closed.
    fn is_closed(&self) -> bool;

    /// Lists layout problems found in the store. Empty means healthy.
    fn verify(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}

/// Opens and creates stores from a store configuration.
pub trait StoreBackend: Send + Sync {
    /// Opens an existing store and returns it with its serialized header.
    fn open(&self, config: &StoreConfig) -> Result<(Arc<dyn Store>, Vec<u8>), StorageError>;

    /// Creates a store and writes its header.
    fn create(&self, config: &StoreConfig, header: &[u8]) -> Result<Arc<dyn Store>, StorageError>;
}

/// Backend dispatching on the location scheme.
///
/// Handles `fs:<path>`, `fs://<path>` and bare paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackend;

impl DefaultBackend {
    fn resolve(config: &StoreConfig) -> Result<PathBuf, StorageError> {
        let location = config.get("location").ok_or(StorageError::MissingLocation)?;
        fs_path(location).ok_or_else(|| StorageError::UnsupportedBackend(location.clone()))
    }
}

impl StoreBackend for DefaultBackend {
    fn open(&self, config: &StoreConfig) -> Result<(Arc<dyn Store>, Vec<u8>), StorageError> {
        let root = Self::resolve(config)?;
        let store = FsStore::open(&root)?;
        let header = store.read_configuration()?;
        Ok((Arc::new(store), header))
    }

    fn create(&self, config: &StoreConfig, header: &[u8]) -> Result<Arc<dyn Store>, StorageError> {
        let root = Self::resolve(config)?;
        Ok(Arc::new(FsStore::create(&root, header)?))
    }
}

/// Maps a location string onto a filesystem path, if it names one.
#[must_use]
pub fn fs_path(location: &str) -> Option<PathBuf> {
    if let Some(path) = location.strip_prefix("fs://") {
        return Some(PathBuf::from(path));
    }
    if let Some(path) = location.strip_prefix("fs:") {
        return Some(PathBuf::from(path));
    }
    if location.contains("://") {
        return None;
    }
    Some(PathBuf::from(location))
}

/// Store rooted at a local directory.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    closed: AtomicBool,
}

impl FsStore {
    /// Opens the store at `root`.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        if !root.join(CONFIG_FILENAME).is_file() {
            return Err(StorageError::NotFound(root.display().to_string()));
        }
        debug!(root = %root.display(), "opened filesystem store");
        Ok(Self {
            root: root.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates the store at `root` and writes its header.
    pub fn create(root: &Path, header: &[u8]) -> Result<Self, StorageError> {
        let config = root.join(CONFIG_FILENAME);
        if config.exists() {
            return Err(StorageError::AlreadyExists(root.display().to_string()));
        }
        fs::create_dir_all(root)?;
        for dir in LAYOUT_DIRS {
            fs::create_dir_all(root.join(dir))?;
        }
        fs::write(&config, header)?;
        debug!(root = %root.display(), "created filesystem store");
        Ok(Self {
            root: root.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory the store lives in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Store for FsStore {
    fn location(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    fn read_configuration(&self) -> Result<Vec<u8>, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(fs::read(self.root.join(CONFIG_FILENAME))?)
    }

    fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(root = %self.root.display(), "closed filesystem store");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn verify(&self) -> Result<Vec<String>, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(LAYOUT_DIRS
            .iter()
            .filter(|dir| !self.root.join(dir).is_dir())
            .map(|dir| format!("missing directory {dir}"))
            .collect())
    }
}
