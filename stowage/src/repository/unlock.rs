//! Recovering the repository key.

use super::encryption::{EncryptionConfig, KeyDerivation};
use super::passphrase::PassphrasePrompt;
use super::storage::StorageConfiguration;
use crate::errors::BootstrapError;
use crate::security::SecurityContext;
use tracing::debug;
use zeroize::Zeroizing;

/// Number of interactive passphrase attempts before giving up.
pub const MAX_PASSPHRASE_ATTEMPTS: usize = 3;

/// Recovers the key of an encrypted repository and stores it in `security`.
///
/// Plaintext repositories need nothing and leave `security` untouched. A
/// non-interactive passphrase gets exactly one attempt; otherwise the user is
/// prompted up to [`MAX_PASSPHRASE_ATTEMPTS`] times.
pub fn setup_encryption(
    config: &StorageConfiguration,
    key_from_file: Option<&str>,
    kdf: &dyn KeyDerivation,
    prompt: &dyn PassphrasePrompt,
    security: &SecurityContext,
) -> Result<(), BootstrapError> {
    let Some(encryption) = &config.encryption else {
        return Ok(());
    };

    if let Some(passphrase) = key_from_file.filter(|k| !k.is_empty()) {
        let key = try_unlock(kdf, encryption, passphrase.as_bytes()).ok_or(BootstrapError::CantUnlock)?;
        security.set_secret(&key);
        return Ok(());
    }

    for attempt in 1..=MAX_PASSPHRASE_ATTEMPTS {
        let passphrase = prompt.read_passphrase("repository")?;
        if let Some(key) = try_unlock(kdf, encryption, passphrase.as_bytes()) {
            security.set_secret(&key);
            return Ok(());
        }
        debug!(attempt, "passphrase rejected");
    }

    Err(BootstrapError::CantUnlock)
}

/// Derives and verifies a key. A derivation failure and a wrong key look the same.
fn try_unlock(
    kdf: &dyn KeyDerivation,
    encryption: &EncryptionConfig,
    passphrase: &[u8],
) -> Option<Zeroizing<Vec<u8>>> {
    let key = kdf.derive_key(&encryption.kdf, passphrase).ok()?;
    kdf.verify_canary(encryption, &key).then_some(key)
}
