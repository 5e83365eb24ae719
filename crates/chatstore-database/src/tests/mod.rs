//! Integration tests for the chat store.
//!
//! - `scenarios.rs`   - end-to-end walkthroughs of the main workflows
//! - `properties.rs`  - invariants that must hold across operations
//! - `lifecycle.rs`   - chat/message CRUD, attachments, keys, reopen
//! - `maintenance.rs` - batches, pagination filters, metrics, optimize

mod lifecycle;
mod scenarios;

use crate::{Chat, ChatStore, Message};
use chatstore_config_and_utils::Config;
use chatstore_keychain::{KeyStore, MemoryStorage, SecureStorage, StorageResult};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Keychain that outlives a single store, so a reopened store sees the
/// same key.
struct SharedKeychain(Arc<MemoryStorage>);

impl SecureStorage for SharedKeychain {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.0.set(key, value)
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.0.get(key)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        self.0.delete(key)
    }
}

/// A temp directory, a keychain and a config to open stores with.
pub(crate) struct Harness {
    dir: TempDir,
    keychain: Arc<MemoryStorage>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            keychain: Arc::new(MemoryStorage::new()),
            config: Config::default(),
        }
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        let mut harness = Self::new();
        harness.config.batch_size = batch_size;
        harness
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("data").join("chats.sqlite")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn key_store(&self) -> KeyStore {
        KeyStore::new(Box::new(SharedKeychain(self.keychain.clone())))
    }

    /// Swap in an empty keychain, as if the key had been lost.
    pub fn lose_keychain(&mut self) {
        self.keychain = Arc::new(MemoryStorage::new());
    }

    pub async fn open(&self) -> ChatStore {
        ChatStore::open_at(&self.db_path(), &self.backups_dir(), &self.config, self.key_store())
            .await
            .unwrap()
    }

    /// A plain connection to the store file, for setting up states the
    /// public API refuses to create.
    pub fn raw(&self) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(self.db_path()).unwrap();
        conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
        conn
    }
}

pub(crate) async fn chat_with_messages(store: &ChatStore, title: &str, count: usize) -> Chat {
    let chat = Chat::new(title, "openai", "gpt-4o");
    store.save_chat(chat.clone()).await.unwrap();
    for i in 0..count {
        store
            .save_message(Message::new(&chat.id, format!("{title} message {i}"), i % 2 == 0))
            .await
            .unwrap();
    }
    chat
}

/// Basic workflow test demonstrating core functionality.
#[tokio::test]
async fn basic_workflow() {
    let harness = Harness::new();
    let store = harness.open().await;

    // Create chat
    let chat = Chat::new("Trip planning", "anthropic", "claude");
    store.save_chat(chat.clone()).await.unwrap();

    // Append messages
    store
        .save_message(Message::new(&chat.id, "Where should we go in spring?", true))
        .await
        .unwrap();
    store
        .save_message(Message::new(&chat.id, "Kyoto is lovely in April.", false))
        .await
        .unwrap();

    // Summary follows the messages
    let loaded = store.load_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(loaded.message_count, 2);
    assert_eq!(loaded.last_message_preview.as_deref(), Some("Kyoto is lovely in April."));

    // Search sees both chat and messages
    assert_eq!(store.search_chats("kyoto").await.unwrap(), vec![chat.id.clone()]);
    assert_eq!(store.search_messages("spring", None).await.unwrap().len(), 1);

    // Delete
    assert!(store.delete_chat(&chat.id).await.unwrap());
    assert!(store.load_messages(&chat.id).await.unwrap().is_empty());
    assert!(store.search_health().await.unwrap().is_healthy());

    store.close().await.unwrap();
}
