//! Keychain Access backend.

use crate::{SecureStorage, StorageError, StorageResult};
use security_framework::base::Error as SecError;
use security_framework::passwords::{
    delete_generic_password, get_generic_password, set_generic_password,
};
use tracing::debug;

/// errSecItemNotFound
const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

pub struct KeychainStorage {
    service_name: String,
}

impl KeychainStorage {
    pub fn new(service_name: &str) -> StorageResult<Self> {
        Ok(Self {
            service_name: service_name.to_string(),
        })
    }
}

fn is_not_found(e: &SecError) -> bool {
    e.code() == ERR_SEC_ITEM_NOT_FOUND
}

impl SecureStorage for KeychainStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        debug!(service = %self.service_name, entry = %key, "Writing keychain item");

        // set_generic_password updates in place when the item exists.
        set_generic_password(&self.service_name, key, value.as_bytes()).map_err(|e| {
            StorageError::Platform(format!("Keychain write failed for {}: {}", key, e))
        })
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        debug!(service = %self.service_name, entry = %key, "Reading keychain item");

        match get_generic_password(&self.service_name, key) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StorageError::Encoding(e.to_string())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(StorageError::Platform(format!(
                "Keychain read failed for {}: {}",
                key, e
            ))),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        debug!(service = %self.service_name, entry = %key, "Removing keychain item");

        match delete_generic_password(&self.service_name, key) {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(StorageError::Platform(format!(
                "Keychain delete failed for {}: {}",
                key, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // touches the login keychain
    fn keychain_round_trip() {
        let storage = KeychainStorage::new("com.chatstore.app.test").unwrap();
        let _ = storage.delete("probe");

        storage.set("probe", "first").unwrap();
        storage.set("probe", "second").unwrap();
        assert_eq!(storage.get("probe").unwrap().as_deref(), Some("second"));

        assert!(storage.delete("probe").unwrap());
        assert!(!storage.delete("probe").unwrap());
    }
}
