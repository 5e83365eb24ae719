//! Database key management on top of a [`SecureStorage`] backend.

use crate::{SecureStorage, StorageError, StorageKeys, StorageResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;

/// Length of the database encryption key in bytes.
pub const DATABASE_KEY_SIZE: usize = 32;

/// Keeps the database key, its rotation timestamp, and keys retired by
/// rotation. Keys are stored base64-encoded.
pub struct KeyStore {
    storage: Box<dyn SecureStorage>,
}

impl KeyStore {
    pub fn new(storage: Box<dyn SecureStorage>) -> Self {
        Self { storage }
    }

    /// Generate a fresh random database key.
    pub fn generate_key() -> [u8; DATABASE_KEY_SIZE] {
        let mut key = [0u8; DATABASE_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    // ==========================================
    // Active key
    // ==========================================

    /// Read the active database key.
    pub fn get_database_key(&self) -> StorageResult<Option<[u8; DATABASE_KEY_SIZE]>> {
        match self.storage.get(StorageKeys::DATABASE_KEY)? {
            Some(encoded) => decode_key(&encoded).map(Some),
            None => Ok(None),
        }
    }

    /// Store `key` as the active database key and stamp its rotation time.
    pub fn set_database_key(&self, key: &[u8; DATABASE_KEY_SIZE]) -> StorageResult<()> {
        self.storage
            .set(StorageKeys::DATABASE_KEY, &BASE64.encode(key))?;
        self.set_key_rotated_at(Utc::now())
    }

    /// Remove the active key and its timestamp.
    pub fn delete_database_key(&self) -> StorageResult<bool> {
        let removed = self.storage.delete(StorageKeys::DATABASE_KEY)?;
        self.storage.delete(StorageKeys::DATABASE_KEY_ROTATED_AT)?;
        Ok(removed)
    }

    pub fn has_database_key(&self) -> StorageResult<bool> {
        self.storage.has(StorageKeys::DATABASE_KEY)
    }

    // ==========================================
    // Rotation timestamp
    // ==========================================

    /// When the active key was created or last rotated.
    pub fn get_key_rotated_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        match self.storage.get(StorageKeys::DATABASE_KEY_ROTATED_AT)? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| StorageError::Encoding(format!("Bad rotation timestamp: {}", e))),
            None => Ok(None),
        }
    }

    pub fn set_key_rotated_at(&self, at: DateTime<Utc>) -> StorageResult<()> {
        self.storage
            .set(StorageKeys::DATABASE_KEY_ROTATED_AT, &at.to_rfc3339())
    }

    // ==========================================
    // Retired keys
    // ==========================================

    /// Keep a key replaced by rotation, addressable by its hash.
    pub fn retire_key(&self, key_hash: &str, key: &[u8; DATABASE_KEY_SIZE]) -> StorageResult<()> {
        tracing::debug!(key_hash = %key_hash, "Retiring database key");
        self.storage
            .set(&StorageKeys::retired_key(key_hash), &BASE64.encode(key))
    }

    pub fn get_retired_key(&self, key_hash: &str) -> StorageResult<Option<[u8; DATABASE_KEY_SIZE]>> {
        match self.storage.get(&StorageKeys::retired_key(key_hash))? {
            Some(encoded) => decode_key(&encoded).map(Some),
            None => Ok(None),
        }
    }

    pub fn delete_retired_key(&self, key_hash: &str) -> StorageResult<bool> {
        self.storage.delete(&StorageKeys::retired_key(key_hash))
    }
}

fn decode_key(encoded: &str) -> StorageResult<[u8; DATABASE_KEY_SIZE]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| StorageError::Encoding(e.to_string()))?;

    bytes.try_into().map_err(|bytes: Vec<u8>| {
        StorageError::Encoding(format!(
            "Database key must be {} bytes, got {}",
            DATABASE_KEY_SIZE,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use chrono::Duration;

    fn key_store() -> KeyStore {
        KeyStore::new(Box::new(MemoryStorage::new()))
    }

    #[test]
    fn generated_keys_differ() {
        let a = KeyStore::generate_key();
        let b = KeyStore::generate_key();
        assert_ne!(a, b);
    }

    #[test]
    fn set_and_get_database_key() {
        let store = key_store();
        assert!(store.get_database_key().unwrap().is_none());
        assert!(!store.has_database_key().unwrap());

        let key = KeyStore::generate_key();
        store.set_database_key(&key).unwrap();

        assert_eq!(store.get_database_key().unwrap(), Some(key));
        assert!(store.get_key_rotated_at().unwrap().is_some());
    }

    #[test]
    fn set_database_key_stamps_rotation_time() {
        let store = key_store();
        let before = Utc::now() - Duration::seconds(1);
        store.set_database_key(&KeyStore::generate_key()).unwrap();

        let stamped = store.get_key_rotated_at().unwrap().unwrap();
        assert!(stamped >= before);
    }

    #[test]
    fn wrong_length_key_is_rejected() {
        let storage = MemoryStorage::new();
        storage
            .set(StorageKeys::DATABASE_KEY, &BASE64.encode([1u8; 16]))
            .unwrap();
        let store = KeyStore::new(Box::new(storage));

        let err = store.get_database_key().unwrap_err();
        assert!(matches!(err, StorageError::Encoding(_)));
    }

    #[test]
    fn garbage_key_is_rejected() {
        let storage = MemoryStorage::new();
        storage.set(StorageKeys::DATABASE_KEY, "not base64!!").unwrap();
        let store = KeyStore::new(Box::new(storage));

        assert!(store.get_database_key().is_err());
    }

    #[test]
    fn retired_keys_are_addressed_by_hash() {
        let store = key_store();
        let old = KeyStore::generate_key();

        store.retire_key("abc123", &old).unwrap();
        assert_eq!(store.get_retired_key("abc123").unwrap(), Some(old));
        assert!(store.get_retired_key("other").unwrap().is_none());

        assert!(store.delete_retired_key("abc123").unwrap());
        assert!(store.get_retired_key("abc123").unwrap().is_none());
    }

    #[test]
    fn delete_database_key_removes_timestamp() {
        let store = key_store();
        store.set_database_key(&KeyStore::generate_key()).unwrap();

        assert!(store.delete_database_key().unwrap());
        assert!(store.get_database_key().unwrap().is_none());
        assert!(store.get_key_rotated_at().unwrap().is_none());
        assert!(!store.delete_database_key().unwrap());
    }
}
