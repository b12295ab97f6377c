//! Group payload encryption
//!
//! Provides optional AES-GCM sealing of broadcast coordination messages.
//! All members of a replication group share a password; when it is set,
//! every datagram on the wire is encrypted with a key derived from it.
//! When no password is configured the cipher is a transparent no-op.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;

/// Length of the AES-256 key derived from the group password
const KEY_LEN: usize = 32;

/// Length of the nonce prepended to each sealed payload
const NONCE_LEN: usize = 12;

/// Error types for payload encryption
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Symmetric cipher for group broadcast payloads using AES-256-GCM
///
/// The sealed payload format is:
/// - 12 bytes nonce
/// - ciphertext
/// - 16 bytes authentication tag (appended by AES-GCM)
///
/// The key is the group password padded with `=` (or truncated) to 32 bytes,
/// so every node configured with the same password derives the same key.
pub enum GroupCipher {
    /// No group password configured, payloads pass through untouched
    Plain,
    /// Payloads are sealed with the derived key
    Sealed(Box<Aes256Gcm>),
}

impl GroupCipher {
    /// Create a cipher from an optional group password
    pub fn from_password(password: Option<&str>) -> Self {
        match password {
            Some(pwd) if !pwd.is_empty() => {
                let key = Self::derive_key(pwd);
                GroupCipher::Sealed(Box::new(Aes256Gcm::new((&key).into())))
            }
            _ => GroupCipher::Plain,
        }
    }

    /// Whether payloads are actually encrypted
    pub fn is_sealed(&self) -> bool {
        matches!(self, GroupCipher::Sealed(_))
    }

    /// Pad with `=` or truncate the password to the cipher key length
    fn derive_key(password: &str) -> [u8; KEY_LEN] {
        let mut key = [b'='; KEY_LEN];
        let bytes = password.as_bytes();
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        key
    }

    /// Seal a payload for the wire
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = match self {
            GroupCipher::Plain => return Ok(plaintext.to_vec()),
            GroupCipher::Sealed(cipher) => cipher,
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload received from the wire
    ///
    /// Fails on garbled or foreign ciphertext; callers in the discovery path
    /// are expected to drop such packets rather than propagate the error.
    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = match self {
            GroupCipher::Plain => return Ok(sealed.to_vec()),
            GroupCipher::Sealed(cipher) => cipher,
        };

        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::InvalidData("payload too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}
