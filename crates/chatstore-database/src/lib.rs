//! Embedded persistence engine for chat history.
//!
//! This crate provides:
//! - Single-writer async SQLite executor and a read-only connection pool
//! - Versioned schema migrations with backup-before-migrate
//! - Encryption key lifecycle backed by the OS keychain
//! - ChaCha20-Poly1305 sealing for message attachments
//! - FTS5 search shadow tables kept in step with chats and messages
//! - Pagination, batch mutation, archival, orphan cleanup and metrics
//! - [`ChatStore`], which ties all of the above together
//!
//! # Architecture
//!
//! All mutations go through [`AsyncDatabase`], one dedicated thread that runs
//! closures in FIFO order. Reads go through [`ReadPool`] and see a consistent
//! WAL snapshot per call.
//!
//! ```ignore
//! let store = ChatStore::open(&paths, &config, chatstore_keychain::create_key_store()).await?;
//! store.save_chat(Chat::new("Rust questions", "openai", "gpt-4o")).await?;
//! let ids = store.search_chats("rust").await?;
//! ```
//!
//! **Important**: Only SQL runs inside `db.call()`. Keychain access and
//! encryption happen on the calling task.

mod backup;
mod encryption;
mod error;
mod executor;
mod key_vault;
mod migrations;
mod models;
mod optimizer;
mod pool;
pub mod queries;
mod schema;
pub mod search;
mod store;

#[cfg(test)]
mod tests;

pub use backup::{BackupInfo, BackupManager};
pub use encryption::{generate_nonce, open, seal, EncryptionKey, KEY_SIZE, NONCE_SIZE};
pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use key_vault::{EncryptionStatus, KeyVault, SecurityReport};
pub use migrations::{
    current_version, history, registry, Migration, MigrationEngine, MigrationOutcome,
    BASELINE_DESCRIPTION,
};
pub use models::*;
pub use optimizer::*;
pub use pool::{PoolConfig, PoolState, ReadPool};
pub use schema::{validate as validate_schema, CURRENT_SCHEMA_VERSION};
pub use search::{RebuildStats, SearchHealth};
pub use store::ChatStore;
