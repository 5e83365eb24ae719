//! ChaCha20-Poly1305 encryption for attachment payloads.

use crate::{DatabaseError, DatabaseResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = chatstore_keychain::DATABASE_KEY_SIZE;

/// A 256-bit database key. `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> DatabaseResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| DatabaseError::InvalidEncryptionKey)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// SHA-256 of the key, hex encoded. Stored in place of the key.
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncryptionKey").field(&"<redacted>").finish()
    }
}

/// Generate a random nonce for encryption.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Seal `plaintext` under a fresh nonce. Returns (ciphertext, nonce);
/// the ciphertext carries the authentication tag.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> DatabaseResult<(Vec<u8>, [u8; NONCE_SIZE])> {
    let nonce = generate_nonce();
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| DatabaseError::EncryptionFailed(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| DatabaseError::EncryptionFailed(e.to_string()))?;

    Ok((ciphertext, nonce))
}

/// Open data produced by [`seal`].
pub fn open(key: &EncryptionKey, nonce: &[u8], ciphertext: &[u8]) -> DatabaseResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(DatabaseError::DecryptionFailed(format!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| DatabaseError::DecryptionFailed(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| DatabaseError::DecryptionFailed(e.to_string()))
}
