//! Encryption key lifecycle.
//!
//! The key lives in the OS keychain ([`KeyStore`]); the database only holds
//! its SHA-256 hash in `encryption_metadata`. Rotation is metadata-only:
//! existing ciphertext is left as is, the replaced key is kept in the
//! keychain under its hash, and every sealed attachment names the hash of
//! the key that sealed it.

use crate::backup::restrict_permissions;
use crate::encryption::EncryptionKey;
use crate::executor::AsyncDatabase;
use crate::{models, queries, DatabaseError, DatabaseResult, EncryptionMetadata, KeyRotationRecord};
use chatstore_keychain::KeyStore;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Findings of [`KeyVault::validate_security`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    /// Problems that leave data unprotected or unreadable.
    pub issues: Vec<String>,
    /// Hygiene problems worth fixing.
    pub warnings: Vec<String>,
}

impl SecurityReport {
    pub fn is_secure(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Encryption state of an open store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionStatus {
    /// The store has a registered key.
    pub is_encrypted: bool,
    pub key_hash: Option<String>,
    pub encrypted_at: Option<DateTime<Utc>>,
    /// The keychain's key matches the registered hash.
    pub key_matches: bool,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub rotation_due: bool,
}

/// Generates, stores, rotates and validates the database key.
#[derive(Clone)]
pub struct KeyVault {
    key_store: Arc<KeyStore>,
    rotation_interval: Duration,
    /// Keys by hash. The mapping never changes, so entries stay valid
    /// across rotations.
    cache: Arc<Mutex<HashMap<String, EncryptionKey>>>,
}

impl KeyVault {
    /// Intervals too large for a `Duration` saturate.
    pub fn new(key_store: KeyStore, rotation_interval_days: i64) -> Self {
        Self {
            key_store: Arc::new(key_store),
            rotation_interval: Duration::try_days(rotation_interval_days).unwrap_or(Duration::MAX),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn remember(&self, key: &EncryptionKey) {
        self.cache.lock().insert(key.hash(), key.clone());
    }

    /// The active key, created and stored on first use.
    pub fn get_or_create(&self) -> DatabaseResult<EncryptionKey> {
        if let Some(key) = self.key_store.get_database_key()? {
            let key = EncryptionKey::from_bytes(key);
            self.remember(&key);
            return Ok(key);
        }

        let key = EncryptionKey::from_bytes(KeyStore::generate_key());
        self.key_store.set_database_key(key.as_bytes())?;
        self.remember(&key);
        info!(key_hash = %key.hash(), "Generated database key");
        Ok(key)
    }

    /// The active key, if one exists.
    pub fn current_key(&self) -> DatabaseResult<Option<EncryptionKey>> {
        let key = self
            .key_store
            .get_database_key()?
            .map(EncryptionKey::from_bytes);
        if let Some(key) = &key {
            self.remember(key);
        }
        Ok(key)
    }

    /// Unconditionally replace the active key. The old key is not retained
    /// and the store's metadata is not touched.
    pub fn regenerate(&self) -> DatabaseResult<EncryptionKey> {
        let key = EncryptionKey::from_bytes(KeyStore::generate_key());
        self.key_store.set_database_key(key.as_bytes())?;
        self.remember(&key);
        warn!(key_hash = %key.hash(), "Database key regenerated");
        Ok(key)
    }

    /// Remove the active key from the keychain and forget cached keys.
    pub fn remove(&self) -> DatabaseResult<bool> {
        let removed = self.key_store.delete_database_key()?;
        self.cache.lock().clear();
        if removed {
            warn!("Database key removed");
        }
        Ok(removed)
    }

    /// Resolve a key by hash: the active key or one retired by rotation.
    pub fn key_for_hash(&self, key_hash: &str) -> DatabaseResult<Option<EncryptionKey>> {
        if let Some(key) = self.cache.lock().get(key_hash) {
            return Ok(Some(key.clone()));
        }

        if let Some(key) = self.current_key()? {
            if key.hash() == key_hash {
                return Ok(Some(key));
            }
        }

        let retired = self
            .key_store
            .get_retired_key(key_hash)?
            .map(EncryptionKey::from_bytes);
        if let Some(key) = &retired {
            self.remember(key);
        }
        Ok(retired)
    }

    pub fn last_rotated_at(&self) -> DatabaseResult<Option<DateTime<Utc>>> {
        Ok(self.key_store.get_key_rotated_at()?)
    }

    /// Whether the rotation interval has elapsed since the key was created
    /// or last rotated. A key with no recorded time is due.
    pub fn should_rotate(&self, now: DateTime<Utc>) -> DatabaseResult<bool> {
        Ok(match self.last_rotated_at()? {
            Some(at) => now - at >= self.rotation_interval,
            None => true,
        })
    }

    /// Replace the active key and point the store's metadata at it.
    ///
    /// Keychain work happens outside the writer; only the metadata update
    /// runs on it. If that update fails the previous key is put back.
    pub async fn rotate(&self, db: &AsyncDatabase) -> DatabaseResult<KeyRotationRecord> {
        let previous = self
            .current_key()?
            .ok_or_else(|| DatabaseError::KeyRotationFailed("No active key to rotate".to_string()))?;
        let previous_rotated_at = self.last_rotated_at()?;
        let next = EncryptionKey::from_bytes(KeyStore::generate_key());

        let rotation = KeyRotationRecord {
            previous_key_hash: previous.hash(),
            new_key_hash: next.hash(),
            rotated_at: models::now(),
        };

        self.key_store.retire_key(&rotation.previous_key_hash, previous.as_bytes())?;
        if let Err(e) = self.key_store.set_database_key(next.as_bytes()) {
            let _ = self.key_store.delete_retired_key(&rotation.previous_key_hash);
            return Err(e.into());
        }

        let record = rotation.clone();
        let updated = db
            .call(move |conn| {
                let tx = conn.transaction()?;
                queries::record_key_rotation(&tx, &record)?;
                tx.commit()?;
                Ok(())
            })
            .await;

        if let Err(e) = updated {
            error!(error = %e, "Key rotation metadata update failed, restoring previous key");
            self.restore_previous(&previous, previous_rotated_at, &rotation.previous_key_hash);
            return Err(DatabaseError::KeyRotationFailed(e.to_string()));
        }

        self.remember(&previous);
        self.remember(&next);
        info!(
            previous_key_hash = %rotation.previous_key_hash,
            new_key_hash = %rotation.new_key_hash,
            "Database key rotated"
        );
        Ok(rotation)
    }

    /// Rotate the key of the store at `path`, opening a short-lived writer.
    /// Use [`KeyVault::rotate`] when the store is already open.
    pub async fn rotate_at(&self, path: &Path) -> DatabaseResult<KeyRotationRecord> {
        if !path.exists() {
            return Err(DatabaseError::DatabaseNotFound(path.to_path_buf()));
        }
        let db = AsyncDatabase::open(path).await?;
        let result = self.rotate(&db).await;
        db.close().await?;
        result
    }

    fn restore_previous(
        &self,
        previous: &EncryptionKey,
        rotated_at: Option<DateTime<Utc>>,
        retired_hash: &str,
    ) {
        if let Err(e) = self.key_store.set_database_key(previous.as_bytes()) {
            error!(error = %e, "Failed to restore previous key");
            return;
        }
        if let Some(at) = rotated_at {
            let _ = self.key_store.set_key_rotated_at(at);
        }
        let _ = self.key_store.delete_retired_key(retired_hash);
    }

    /// Encryption state given the store's metadata row.
    pub fn encryption_status(
        &self,
        metadata: Option<EncryptionMetadata>,
    ) -> DatabaseResult<EncryptionStatus> {
        let current = self.current_key()?;

        let key_matches = match (&metadata, &current) {
            (Some(meta), Some(key)) => meta.key_hash == key.hash(),
            _ => false,
        };

        Ok(EncryptionStatus {
            is_encrypted: metadata.is_some(),
            key_hash: metadata.as_ref().map(|m| m.key_hash.clone()),
            encrypted_at: metadata.map(|m| m.encrypted_at),
            key_matches,
            last_rotated_at: self.last_rotated_at()?,
            rotation_due: self.should_rotate(Utc::now())?,
        })
    }

    /// Inspect the store at `path` without modifying it.
    pub fn validate_security(&self, path: &Path) -> SecurityReport {
        let mut report = SecurityReport::default();

        if !path.exists() {
            report
                .issues
                .push(format!("Database file not found: {}", path.display()));
            return report;
        }

        let key = match self.key_store.get_database_key() {
            Ok(Some(bytes)) => Some(EncryptionKey::from_bytes(bytes)),
            Ok(None) => {
                report.issues.push("No encryption key in keychain".to_string());
                None
            }
            Err(e) => {
                report
                    .issues
                    .push(format!("Encryption key is inaccessible: {}", e));
                None
            }
        };

        match read_metadata(path) {
            Ok(Some(meta)) => {
                if let Some(key) = &key {
                    if key.hash() != meta.key_hash {
                        report
                            .issues
                            .push("Encryption key does not match the store's key hash".to_string());
                    }
                }
            }
            Ok(None) => report
                .issues
                .push("Database is not encrypted: no encryption metadata".to_string()),
            Err(e) => report
                .issues
                .push(format!("Database is not encrypted: {}", e)),
        }

        for file in [path.to_path_buf(), sidecar(path, "-wal"), sidecar(path, "-shm")] {
            if let Some(warning) = permission_warning(&file) {
                report.warnings.push(warning);
            }
        }

        match self.should_rotate(Utc::now()) {
            Ok(true) => report.warnings.push("Key rotation is overdue".to_string()),
            Ok(false) => {}
            Err(e) => report
                .warnings
                .push(format!("Key rotation time unreadable: {}", e)),
        }

        report
    }
}

/// Read the metadata row without writing anything.
fn read_metadata(path: &Path) -> DatabaseResult<Option<EncryptionMetadata>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA query_only = ON")?;

    if !crate::schema::table_exists(&conn, "encryption_metadata")? {
        return Ok(None);
    }
    queries::get_encryption_metadata(&conn)
}

fn sidecar(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    name.into()
}

/// A warning if `path` exists and is readable by anyone but its owner.
#[cfg(unix)]
pub(crate) fn permission_warning(path: &Path) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path).ok()?.permissions().mode();
    if mode & 0o077 != 0 {
        Some(format!(
            "{} is accessible to other users (mode {:o})",
            path.display(),
            mode & 0o777
        ))
    } else {
        None
    }
}

#[cfg(not(unix))]
pub(crate) fn permission_warning(_path: &Path) -> Option<String> {
    None
}

/// Tighten a store file and its WAL sidecars to owner-only access.
pub(crate) fn secure_file(path: &Path) -> DatabaseResult<()> {
    for file in [path.to_path_buf(), sidecar(path, "-wal"), sidecar(path, "-shm")] {
        if file.exists() {
            restrict_permissions(&file)?;
        }
    }
    Ok(())
}
