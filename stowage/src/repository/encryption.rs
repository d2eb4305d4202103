//! Key derivation and canary verification.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

const CANARY_DOMAIN: &[u8] = b"stowage/canary/v1";
const SALT_LEN: usize = 16;

/// Errors raised while deriving keys or building encryption parameters.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The stored parameters cannot be used.
    #[error("invalid KDF parameters: {0}")]
    InvalidParams(String),

    /// The derivation itself failed.
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Parameters of the key derivation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Algorithm name. Only `argon2id` is supported.
    pub algorithm: String,
    /// Base64 salt.
    pub salt: String,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
    /// Output length in bytes.
    pub key_len: usize,
}

impl KdfParams {
    /// Default Argon2id parameters with a fresh random salt.
    #[must_use]
    pub fn argon2id() -> Self {
        Self::argon2id_with_cost(19 * 1024, 2, 1)
    }

    /// Argon2id parameters with explicit costs and a fresh random salt.
    #[must_use]
    pub fn argon2id_with_cost(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            algorithm: "argon2id".to_string(),
            salt: BASE64.encode(salt),
            memory_kib,
            iterations,
            parallelism,
            key_len: 32,
        }
    }
}

/// Encryption section of the store header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// How to turn a passphrase into a key.
    pub kdf: KdfParams,
    /// Base64 canary used to recognize the right key.
    pub canary: String,
}

impl EncryptionConfig {
    /// Builds an encryption section for `passphrase` and returns it with the derived key.
    pub fn generate(
        kdf: &dyn KeyDerivation,
        params: KdfParams,
        passphrase: &[u8],
    ) -> Result<(Self, Zeroizing<Vec<u8>>), EncryptionError> {
        let key = kdf.derive_key(&params, passphrase)?;
        let canary = BASE64.encode(canary_for(&key));
        Ok((Self { kdf: params, canary }, key))
    }
}

fn canary_for(key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(CANARY_DOMAIN);
    hasher.update(key);
    hasher.finalize().into()
}

/// Turns a secret into a key and recognizes the right key.
pub trait KeyDerivation: Send + Sync {
    /// Derives a key from `secret` using `params`.
    fn derive_key(&self, params: &KdfParams, secret: &[u8]) -> Result<Zeroizing<Vec<u8>>, EncryptionError>;

    /// Returns whether `key` matches the stored canary.
    fn verify_canary(&self, config: &EncryptionConfig, key: &[u8]) -> bool {
        let Ok(expected) = BASE64.decode(&config.canary) else {
            return false;
        };
        bool::from(canary_for(key).as_slice().ct_eq(expected.as_slice()))
    }
}

/// Argon2id key derivation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2Kdf;

impl KeyDerivation for Argon2Kdf {
    fn derive_key(&self, params: &KdfParams, secret: &[u8]) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        if params.algorithm != "argon2id" {
            return Err(EncryptionError::InvalidParams(format!(
                "unsupported algorithm {}",
                params.algorithm
            )));
        }
        let salt = BASE64
            .decode(&params.salt)
            .map_err(|e| EncryptionError::InvalidParams(format!("salt: {e}")))?;

        let argon_params = argon2::Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(params.key_len),
        )
        .map_err(|e| EncryptionError::InvalidParams(e.to_string()))?;
        let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon_params);

        let mut key = Zeroizing::new(vec![0u8; params.key_len]);
        argon
            .hash_password_into(secret, &salt, &mut key)
            .map_err(|e| EncryptionError::Derivation(e.to_string()))?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_params() -> KdfParams {
        KdfParams::argon2id_with_cost(64, 1, 1)
    }

    #[test]
    fn test_generate_then_verify() {
        let (config, key) = EncryptionConfig::generate(&Argon2Kdf, cheap_params(), b"correct horse").unwrap();

        assert_eq!(key.len(), 32);
        assert!(Argon2Kdf.verify_canary(&config, &key));

        let again = Argon2Kdf.derive_key(&config.kdf, b"correct horse").unwrap();
        assert_eq!(again.as_slice(), key.as_slice());

        let wrong = Argon2Kdf.derive_key(&config.kdf, b"battery staple").unwrap();
        assert!(!Argon2Kdf.verify_canary(&config, &wrong));
    }

    #[test]
    fn test_salt_is_random() {
        assert_ne!(cheap_params().salt, cheap_params().salt);
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let mut params = cheap_params();
        params.algorithm = "scrypt".into();
        assert!(matches!(
            Argon2Kdf.derive_key(&params, b"x"),
            Err(EncryptionError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_rejects_bad_costs() {
        let mut params = cheap_params();
        params.iterations = 0;
        assert!(Argon2Kdf.derive_key(&params, b"x").is_err());
    }

    #[test]
    fn test_corrupt_canary_never_verifies() {
        let (mut config, key) = EncryptionConfig::generate(&Argon2Kdf, cheap_params(), b"pw").unwrap();
        config.canary = "%%%".into();
        assert!(!Argon2Kdf.verify_canary(&config, &key));
    }
}
