//! Interactive passphrase input.

use crate::errors::BootstrapError;
use zeroize::Zeroizing;

/// Source of passphrases typed by the user.
pub trait PassphrasePrompt: Send + Sync {
    /// Reads one passphrase for the named purpose (e.g. `repository`).
    fn read_passphrase(&self, purpose: &str) -> Result<Zeroizing<String>, BootstrapError>;

    /// Reads a new passphrase twice and returns it when both entries match.
    fn read_new_passphrase(&self, purpose: &str) -> Result<Zeroizing<String>, BootstrapError> {
        let first = self.read_passphrase(purpose)?;
        let second = self.read_passphrase(&format!("{purpose} (confirm)"))?;
        if first.as_str() != second.as_str() {
            return Err(BootstrapError::Passphrase("passphrases mismatch".into()));
        }
        if first.is_empty() {
            return Err(BootstrapError::Passphrase("passphrase can't be empty".into()));
        }
        Ok(first)
    }
}

/// Reads from the terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn read_passphrase(&self, purpose: &str) -> Result<Zeroizing<String>, BootstrapError> {
        rpassword::prompt_password(format!("{purpose} passphrase: "))
            .map(Zeroizing::new)
            .map_err(|e| BootstrapError::Passphrase(e.to_string()))
    }
}
