//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Database error type.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Executor, pool, or blocking-task failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// A migration step failed and its transaction was rolled back.
    /// `backup_path` is the snapshot taken before the attempt.
    #[error("Migration failed: {reason} (backup at {})", .backup_path.display())]
    MigrationFailed { reason: String, backup_path: PathBuf },

    #[error("Backup not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    /// The store was written by a newer build than this one.
    #[error("Invalid schema version: store is at v{current}, target is v{target}")]
    InvalidSchemaVersion { current: i64, target: i64 },

    /// No registered migration produces this version.
    #[error("No migration registered for schema version {0}")]
    MigrationChainGap(i64),

    #[error("Schema validation failed: {}", .0.join("; "))]
    SchemaValidationFailed(Vec<String>),

    #[error("Database not found: {}", .0.display())]
    DatabaseNotFound(PathBuf),

    #[error("Invalid encryption key")]
    InvalidEncryptionKey,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key rotation failed: {0}")]
    KeyRotationFailed(String),

    #[error("Keychain access failed: {0}")]
    KeychainAccessFailed(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<chatstore_keychain::StorageError> for DatabaseError {
    fn from(e: chatstore_keychain::StorageError) -> Self {
        DatabaseError::KeychainAccessFailed(e.to_string())
    }
}

impl From<r2d2::Error> for DatabaseError {
    fn from(e: r2d2::Error) -> Self {
        DatabaseError::Connection(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DatabaseError {
    fn from(e: tokio::task::JoinError) -> Self {
        DatabaseError::Connection(format!("Blocking task failed: {}", e))
    }
}

/// Result type alias using DatabaseError.
pub type DatabaseResult<T> = Result<T, DatabaseError>;
