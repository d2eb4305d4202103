//! Security sub-context owning the process's secrets.

use super::SecureString;
use parking_lot::RwLock;
use zeroize::Zeroizing;

/// Owns the repository key and the key-from-file value for one invocation.
///
/// Setting a value replaces the previous vault after clearing it; vaults are
/// never rewritten in place.
#[derive(Debug, Default)]
pub struct SecurityContext {
    secret: RwLock<Option<SecureString>>,
    key_from_file: RwLock<Option<SecureString>>,
}

impl SecurityContext {
    /// Creates an empty security context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the repository key. An empty key removes the current one.
    pub fn set_secret(&self, secret: &[u8]) {
        replace(&self.secret, secret);
    }

    /// Returns a copy of the repository key, if one is held.
    #[must_use]
    pub fn secret(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.secret.read().as_ref().and_then(|s| s.get().ok())
    }

    /// Returns whether a repository key is held.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret
            .read()
            .as_ref()
            .is_some_and(|s| !s.is_cleared())
    }

    /// Stores the passphrase obtained from a key file or other non-interactive source.
    pub fn set_key_from_file(&self, key: &str) {
        replace(&self.key_from_file, key.as_bytes());
    }

    /// Returns a copy of the key-from-file value, if one is held.
    #[must_use]
    pub fn key_from_file(&self) -> Option<Zeroizing<String>> {
        self.key_from_file
            .read()
            .as_ref()
            .and_then(|s| s.get_string().ok())
    }

    /// Clears every held secret.
    pub fn clear(&self) {
        if let Some(secret) = self.secret.write().take() {
            secret.clear();
        }
        if let Some(key) = self.key_from_file.write().take() {
            key.clear();
        }
    }
}

fn replace(slot: &RwLock<Option<SecureString>>, value: &[u8]) {
    let mut slot = slot.write();
    if let Some(old) = slot.take() {
        old.clear();
    }
    *slot = SecureString::new(value).ok();
}
