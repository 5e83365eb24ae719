//! Credential Vault backend.

use crate::{SecureStorage, StorageError, StorageResult};
use tracing::debug;
use windows::core::HSTRING;
use windows::Security::Credentials::{PasswordCredential, PasswordVault};

/// HRESULT_FROM_WIN32(ERROR_NOT_FOUND)
const ELEMENT_NOT_FOUND: u32 = 0x8007_0490;

pub struct CredentialStorage {
    resource: HSTRING,
}

impl CredentialStorage {
    /// Opens the vault once so an unavailable vault is reported at startup.
    pub fn new(service_name: &str) -> StorageResult<Self> {
        vault()?;
        Ok(Self {
            resource: HSTRING::from(service_name),
        })
    }

    /// Look up the credential for `key`, `None` when absent.
    fn find(&self, vault: &PasswordVault, key: &str) -> StorageResult<Option<PasswordCredential>> {
        match vault.Retrieve(&self.resource, &HSTRING::from(key)) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) if e.code().0 as u32 == ELEMENT_NOT_FOUND => Ok(None),
            Err(e) => Err(StorageError::Platform(format!(
                "Credential lookup failed for {}: {}",
                key, e
            ))),
        }
    }
}

fn vault() -> StorageResult<PasswordVault> {
    PasswordVault::new()
        .map_err(|e| StorageError::Platform(format!("Credential Vault unavailable: {}", e)))
}

impl SecureStorage for CredentialStorage {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        debug!(resource = %self.resource, entry = %key, "Writing credential");
        let vault = vault()?;

        if let Some(existing) = self.find(&vault, key)? {
            vault
                .Remove(&existing)
                .map_err(|e| StorageError::Platform(e.to_string()))?;
        }

        let credential = PasswordCredential::CreatePasswordCredential(
            &self.resource,
            &HSTRING::from(key),
            &HSTRING::from(value),
        )
        .map_err(|e| StorageError::Platform(e.to_string()))?;

        vault
            .Add(&credential)
            .map_err(|e| StorageError::Platform(format!("Credential write failed: {}", e)))
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        debug!(resource = %self.resource, entry = %key, "Reading credential");
        let vault = vault()?;

        let Some(credential) = self.find(&vault, key)? else {
            return Ok(None);
        };

        // Password is empty until RetrievePassword populates it.
        credential
            .RetrievePassword()
            .map_err(|e| StorageError::Platform(e.to_string()))?;
        let password = credential
            .Password()
            .map_err(|e| StorageError::Platform(e.to_string()))?;

        Ok(Some(password.to_string()))
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        debug!(resource = %self.resource, entry = %key, "Removing credential");
        let vault = vault()?;

        match self.find(&vault, key)? {
            Some(credential) => {
                vault
                    .Remove(&credential)
                    .map_err(|e| StorageError::Platform(format!("Credential delete failed: {}", e)))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // needs an interactive Windows session
    fn credential_vault_round_trip() {
        let storage = CredentialStorage::new("com.chatstore.app.test").unwrap();
        let _ = storage.delete("probe");

        storage.set("probe", "first").unwrap();
        storage.set("probe", "second").unwrap();
        assert_eq!(storage.get("probe").unwrap().as_deref(), Some("second"));

        assert!(storage.delete("probe").unwrap());
        assert_eq!(storage.get("probe").unwrap(), None);
    }
}
