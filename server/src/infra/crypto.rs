//! Secret sealing for at-rest storage.
//!
//! AES-256-GCM with a per-blob key derived from the master key via
//! HKDF-SHA256 and a random salt, so equal plaintexts never share
//! ciphertext. Sealed layout: `salt(32) || nonce(12) || ciphertext+tag`.
//! Sealing happens at the storage boundary only — business logic passes
//! [`SecretString`] around and never sees blob internals.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

const KEY_SIZE: usize = 32;
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HKDF_INFO: &[u8] = b"roost-secret-v1";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("master sealing key must be at least {KEY_SIZE} bytes")]
    KeyTooShort,
    #[error("sealing failed: {0}")]
    Seal(String),
    #[error("blob is malformed or was tampered with")]
    Open,
}

/// Holds the master key and performs seal/open.
pub struct SecretSealer {
    master_key: SecretString,
}

impl SecretSealer {
    /// Create a sealer from the configured master key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key carries fewer than 32 bytes.
    pub fn new(master_key: SecretString) -> Result<Self, SealError> {
        if master_key.expose_secret().len() < KEY_SIZE {
            return Err(SealError::KeyTooShort);
        }
        Ok(Self { master_key })
    }

    /// Seal plaintext into an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation or encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = self.derive_key(&salt)?;

        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| SealError::Seal(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SealError::Seal(e.to_string()))?;

        let mut blob = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a sealed blob back into plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is truncated, the key is wrong, or the
    /// ciphertext was tampered with.
    pub fn open(&self, blob: &[u8]) -> Result<SecretString, SealError> {
        if blob.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(SealError::Open);
        }
        let (salt, rest) = blob.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let key = self.derive_key(salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealError::Open)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SealError::Open)?;
        let text = String::from_utf8(plaintext).map_err(|_| SealError::Open)?;
        Ok(SecretString::from(text))
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_SIZE], SealError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.master_key.expose_secret().as_bytes());
        let mut derived = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut derived)
            .map_err(|_| SealError::Seal("HKDF expansion failed".into()))?;
        Ok(derived)
    }
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSealer")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}
