//! In-memory vault for a single secret buffer.

use super::memlock::{platform_locker, MemoryLocker};
use crate::errors::SecretError;
use parking_lot::RwLock;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

struct Inner {
    data: Vec<u8>,
    locked: bool,
    cleared: bool,
}

/// Holds one sensitive byte buffer.
///
/// The buffer is copied in on creation and never handed out by reference:
/// every read returns a fresh [`Zeroizing`] copy owned by the caller. A vault
/// is never mutated in place; replacing a secret means replacing the vault.
/// [`SecureString::clear`] is terminal and idempotent, and runs on drop as a
/// safety net.
pub struct SecureString {
    inner: RwLock<Inner>,
    locker: &'static dyn MemoryLocker,
}

impl SecureString {
    /// Creates a vault holding a copy of `data`.
    ///
    /// Memory locking is attempted; failure only leaves the vault unlocked.
    pub fn new(data: &[u8]) -> Result<Self, SecretError> {
        Self::with_locker(data, platform_locker())
    }

    /// Creates a vault using a specific memory locking backend.
    pub fn with_locker(data: &[u8], locker: &'static dyn MemoryLocker) -> Result<Self, SecretError> {
        if data.is_empty() {
            return Err(SecretError::Empty);
        }

        let copy = data.to_vec();
        let locked = locker.lock(&copy);

        Ok(Self {
            inner: RwLock::new(Inner {
                data: copy,
                locked,
                cleared: false,
            }),
            locker,
        })
    }

    /// Creates a vault from a string.
    pub fn from_string(value: &str) -> Result<Self, SecretError> {
        let bytes = Zeroizing::new(value.as_bytes().to_vec());
        Self::new(&bytes)
    }

    /// Returns a copy of the secret. The copy is wiped when dropped.
    pub fn get(&self) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let inner = self.inner.read();
        if inner.cleared {
            return Err(SecretError::Cleared);
        }
        Ok(Zeroizing::new(inner.data.clone()))
    }

    /// Returns a copy of the secret as a string, replacing invalid UTF-8.
    pub fn get_string(&self) -> Result<Zeroizing<String>, SecretError> {
        let data = self.get()?;
        Ok(Zeroizing::new(String::from_utf8_lossy(&data).into_owned()))
    }

    /// Constant-time comparison against another vault.
    ///
    /// A cleared vault on either side is an error, not a mismatch.
    pub fn equals(&self, other: &Self) -> Result<bool, SecretError> {
        if std::ptr::eq(self, other) {
            return if self.is_cleared() {
                Err(SecretError::Cleared)
            } else {
                Ok(true)
            };
        }

        // Address order, so crossed comparisons cannot deadlock behind a queued clear.
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };
        let first = first.inner.read();
        let second = second.inner.read();
        if first.cleared || second.cleared {
            return Err(SecretError::Cleared);
        }

        Ok(bool::from(first.data.as_slice().ct_eq(second.data.as_slice())))
    }

    /// Constant-time comparison against raw bytes.
    pub fn equals_bytes(&self, data: &[u8]) -> Result<bool, SecretError> {
        let inner = self.inner.read();
        if inner.cleared {
            return Err(SecretError::Cleared);
        }
        Ok(bool::from(inner.data.as_slice().ct_eq(data)))
    }

    /// Overwrites the buffer with random bytes, then zeros, then unlocks it.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        if inner.cleared {
            return;
        }

        rand::thread_rng().fill_bytes(&mut inner.data);
        inner.data.as_mut_slice().zeroize();

        if inner.locked {
            self.locker.unlock(&inner.data);
            inner.locked = false;
        }

        inner.cleared = true;
    }

    /// Length of the secret, or 0 once cleared.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        if inner.cleared {
            0
        } else {
            inner.data.len()
        }
    }

    /// Returns true when the vault holds no readable bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the vault has been cleared.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.inner.read().cleared
    }

    /// Returns whether the buffer is currently memory-locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.read().locked
    }
}

impl Drop for SecureString {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureString")
            .field("len", &self.len())
            .field("locked", &self.is_locked())
            .field("cleared", &self.is_cleared())
            .finish()
    }
}
