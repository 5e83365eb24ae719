//! Secret Service backend (GNOME Keyring, KWallet).

use crate::{SecureStorage, StorageError, StorageResult};
use secret_service::blocking::{Collection, SecretService};
use secret_service::EncryptionType;
use std::collections::HashMap;
use tracing::debug;

pub struct SecretServiceStorage {
    service_name: String,
}

impl SecretServiceStorage {
    /// Connects once to fail fast when no Secret Service daemon is running.
    pub fn new(service_name: &str) -> StorageResult<Self> {
        SecretService::connect(EncryptionType::Dh).map_err(|e| {
            StorageError::Platform(format!("Secret Service unavailable: {}", e))
        })?;

        Ok(Self {
            service_name: service_name.to_string(),
        })
    }

    /// Run `f` against the unlocked default collection.
    fn in_default_collection<T>(
        &self,
        entry: &str,
        f: impl FnOnce(&Collection<'_>, HashMap<&str, &str>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let ss = SecretService::connect(EncryptionType::Dh).map_err(platform)?;
        let collection = ss.get_default_collection().map_err(platform)?;

        if collection.is_locked().map_err(platform)? {
            collection.unlock().map_err(|e| {
                StorageError::Platform(format!("Default collection stayed locked: {}", e))
            })?;
        }

        let attributes = HashMap::from([
            ("service", self.service_name.as_str()),
            ("entry", entry),
        ]);
        f(&collection, attributes)
    }
}

fn platform(e: secret_service::Error) -> StorageError {
    StorageError::Platform(e.to_string())
}

impl SecureStorage for SecretServiceStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        debug!(service = %self.service_name, entry = %key, "Writing secret");
        let label = format!("{} ({})", self.service_name, key);

        self.in_default_collection(key, |collection, attributes| {
            collection
                .create_item(&label, attributes, value.as_bytes(), true, "text/plain")
                .map_err(platform)?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        debug!(service = %self.service_name, entry = %key, "Reading secret");

        self.in_default_collection(key, |collection, attributes| {
            let items = collection.search_items(attributes).map_err(platform)?;
            let Some(item) = items.first() else {
                return Ok(None);
            };

            let secret = item.get_secret().map_err(platform)?;
            String::from_utf8(secret)
                .map(Some)
                .map_err(|e| StorageError::Encoding(e.to_string()))
        })
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        debug!(service = %self.service_name, entry = %key, "Removing secret");

        self.in_default_collection(key, |collection, attributes| {
            let items = collection.search_items(attributes).map_err(platform)?;
            let mut removed = false;
            for item in &items {
                item.delete().map_err(platform)?;
                removed = true;
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // needs a D-Bus session with a Secret Service provider
    fn secret_service_round_trip() {
        let storage = SecretServiceStorage::new("com.chatstore.app.test").unwrap();
        let _ = storage.delete("probe");

        storage.set("probe", "first").unwrap();
        storage.set("probe", "second").unwrap();
        assert_eq!(storage.get("probe").unwrap().as_deref(), Some("second"));

        assert!(storage.delete("probe").unwrap());
        assert_eq!(storage.get("probe").unwrap(), None);
    }
}
