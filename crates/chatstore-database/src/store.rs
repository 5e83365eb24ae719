//! The chat store: one writer, a reader pool, and the components built on
//! them.

use crate::backup::BackupManager;
use crate::encryption::{self, EncryptionKey};
use crate::executor::AsyncDatabase;
use crate::key_vault::{permission_warning, secure_file, KeyVault};
use crate::migrations::{self, MigrationEngine, MigrationOutcome};
use crate::optimizer::{
    ArchiveOptions, ArchiveReport, BatchResult, ChatFilter, CleanupReport, MessageFilter,
    OptimizeReport, PaginatedResult, PaginationParams, PerformanceMetrics, PerformanceOptimizer,
};
use crate::pool::{PoolConfig, ReadPool};
use crate::{
    models, queries, schema, search, BackupInfo, Chat, DatabaseError, DatabaseResult,
    EncryptionStatus, KeyRotationRecord, Message, MessageRecord, MigrationRecord, RebuildStats,
    SealedAttachment, SearchHealth, SecurityReport,
};
use chatstore_config_and_utils::{Config, Paths};
use chatstore_keychain::KeyStore;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// An open chat store.
///
/// Construct with [`ChatStore::open`]; the store is ready once it returns.
/// Clones share the same writer and reader pool.
#[derive(Clone)]
pub struct ChatStore {
    db: AsyncDatabase,
    readers: ReadPool,
    vault: KeyVault,
    backups: BackupManager,
    optimizer: PerformanceOptimizer,
    search_result_limit: usize,
}

impl ChatStore {
    /// Open the store at the standard application-support location.
    pub async fn open(paths: &Paths, config: &Config, key_store: KeyStore) -> DatabaseResult<Self> {
        Self::open_at(&paths.database_file(), &paths.backups_dir(), config, key_store).await
    }

    /// Open (creating if needed) the store at `db_path`.
    ///
    /// Migrates the schema, validates it, makes sure an encryption key is
    /// registered and repairs the search index before returning.
    pub async fn open_at(
        db_path: &Path,
        backups_dir: &Path,
        config: &Config,
        key_store: KeyStore,
    ) -> DatabaseResult<Self> {
        let started = Instant::now();
        config
            .validate()
            .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(backups_dir)?;

        let db = AsyncDatabase::open(db_path).await?;
        let backups = BackupManager::for_database(db_path, backups_dir, config.max_backups);

        let migration_backups = backups.clone();
        let outcome = db
            .call(move |conn| MigrationEngine::default().migrate_to_current(conn, &migration_backups))
            .await?;
        if let MigrationOutcome::Migrated {
            from_version,
            to_version,
            backup_path,
        } = &outcome
        {
            info!(from_version, to_version, backup = %backup_path.display(), "Store migrated");
            let pruned = backups.prune()?;
            debug!(pruned, "Pruned old backups");
        }

        let issues = db.call(|conn| schema::validate(conn)).await?;
        if !issues.is_empty() {
            return Err(DatabaseError::SchemaValidationFailed(issues));
        }

        let vault = KeyVault::new(key_store, config.key_rotation_interval_days);
        let key = vault.get_or_create()?;
        Self::register_key(&db, &key).await?;

        let health = db.call(|conn| search::check_health(conn)).await?;
        if !health.is_healthy() {
            warn!(
                chat_rows = health.chat_rows,
                chat_entries = health.chat_entries,
                message_rows = health.message_rows,
                message_entries = health.message_entries,
                "Search index inconsistent, rebuilding"
            );
            db.call(|conn| search::rebuild(conn)).await?;
        }

        secure_file(db_path)?;

        let readers = ReadPool::open(
            db_path,
            PoolConfig {
                max_size: config.reader_pool_size,
                ..PoolConfig::default()
            },
        )?;

        let optimizer = PerformanceOptimizer::new(
            db.clone(),
            readers.clone(),
            config.batch_size,
            Duration::from_millis(config.slow_query_threshold_ms),
        );

        info!(
            path = %db_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chat store ready"
        );

        Ok(Self {
            db,
            readers,
            vault,
            backups,
            optimizer,
            search_result_limit: config.search_result_limit,
        })
    }

    async fn register_key(db: &AsyncDatabase, key: &EncryptionKey) -> DatabaseResult<()> {
        let key_hash = key.hash();
        let (registered, metadata) = db
            .call(move |conn| {
                let registered =
                    queries::register_encryption_metadata(conn, &key_hash, &models::now())?;
                Ok((registered, queries::get_encryption_metadata(conn)?))
            })
            .await?;

        if registered {
            info!(key_hash = %key.hash(), "Registered encryption key");
        } else if let Some(meta) = metadata.filter(|m| m.key_hash != key.hash()) {
            warn!(
                registered_hash = %meta.key_hash,
                keychain_hash = %key.hash(),
                "Keychain key does not match the store's registered key"
            );
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn optimizer(&self) -> &PerformanceOptimizer {
        &self.optimizer
    }

    pub fn key_vault(&self) -> &KeyVault {
        &self.vault
    }

    // ==========================================
    // Attachments
    // ==========================================

    fn seal_message(&self, message: Message) -> DatabaseResult<MessageRecord> {
        let attachment = match &message.attachment {
            Some(bytes) => {
                let key = self.vault.get_or_create()?;
                let (ciphertext, nonce) = encryption::seal(&key, bytes)?;
                Some(SealedAttachment {
                    ciphertext,
                    nonce: nonce.to_vec(),
                    key_hash: key.hash(),
                })
            }
            None => None,
        };

        Ok(MessageRecord {
            id: message.id,
            chat_id: message.chat_id,
            content: message.content,
            is_from_user: message.is_from_user,
            timestamp: message.timestamp,
            attachment,
            status: message.status,
            edited_at: message.edited_at,
            response_metadata: message.response_metadata,
        })
    }

    fn open_record(&self, record: MessageRecord) -> DatabaseResult<Message> {
        let attachment = match &record.attachment {
            Some(sealed) => {
                let key = self.vault.key_for_hash(&sealed.key_hash)?.ok_or_else(|| {
                    DatabaseError::DecryptionFailed(format!(
                        "No key for hash {} (message {})",
                        sealed.key_hash, record.id
                    ))
                })?;
                Some(encryption::open(&key, &sealed.nonce, &sealed.ciphertext)?)
            }
            None => None,
        };

        Ok(Message {
            id: record.id,
            chat_id: record.chat_id,
            content: record.content,
            is_from_user: record.is_from_user,
            timestamp: record.timestamp,
            attachment,
            status: record.status,
            edited_at: record.edited_at,
            response_metadata: record.response_metadata,
        })
    }

    // ==========================================
    // Chats
    // ==========================================

    /// Insert or update a chat and its search entry.
    pub async fn save_chat(&self, chat: Chat) -> DatabaseResult<()> {
        debug!(chat_id = %chat.id, "Saving chat");
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                queries::upsert_chat(&tx, &chat)?;
                search::sync_chat(&tx, &chat.id)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn load_chat(&self, id: &str) -> DatabaseResult<Option<Chat>> {
        let id = id.to_string();
        self.readers.read(move |conn| queries::get_chat(conn, &id)).await
    }

    /// All chats, most recently updated first.
    pub async fn load_chats(&self) -> DatabaseResult<Vec<Chat>> {
        self.readers.read(|conn| queries::list_chats(conn)).await
    }

    /// Delete a chat with its messages and search entries.
    pub async fn delete_chat(&self, id: &str) -> DatabaseResult<bool> {
        let id = id.to_string();
        let deleted = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = queries::delete_chat(&tx, &id)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        debug!(deleted, "Chat delete");
        Ok(deleted)
    }

    // ==========================================
    // Messages
    // ==========================================

    /// Insert or update a message. The chat must exist; its count, preview
    /// and search entry are refreshed in the same transaction, as are the
    /// previous chat's when the message changes chats.
    pub async fn save_message(&self, message: Message) -> DatabaseResult<()> {
        let record = self.seal_message(message)?;
        debug!(message_id = %record.id, chat_id = %record.chat_id, "Saving message");

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !queries::chat_exists(&tx, &record.chat_id)? {
                    return Err(DatabaseError::NotFound(format!("chat {}", record.chat_id)));
                }
                let previous_chat = queries::message_chat_id(&tx, &record.id)?
                    .filter(|chat_id| *chat_id != record.chat_id);
                queries::upsert_message(&tx, &record)?;
                search::sync_message(&tx, &record.id)?;
                // A message moved between chats changes both summaries.
                for chat_id in previous_chat.iter().chain(std::iter::once(&record.chat_id)) {
                    queries::refresh_chat_summary(&tx, chat_id)?;
                    search::sync_chat(&tx, chat_id)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Messages of a chat in chronological order, attachments decrypted.
    pub async fn load_messages(&self, chat_id: &str) -> DatabaseResult<Vec<Message>> {
        let chat_id = chat_id.to_string();
        let records = self
            .readers
            .read(move |conn| queries::list_messages(conn, &chat_id))
            .await?;
        records.into_iter().map(|r| self.open_record(r)).collect()
    }

    pub async fn load_message(&self, id: &str) -> DatabaseResult<Option<Message>> {
        let id = id.to_string();
        let record = self.readers.read(move |conn| queries::get_message(conn, &id)).await?;
        record.map(|r| self.open_record(r)).transpose()
    }

    /// Replace a message's text and mark it edited.
    pub async fn update_message_content(&self, id: &str, content: &str) -> DatabaseResult<()> {
        let id = id.to_string();
        let content = content.to_string();
        let edited_at = models::now();

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let chat_id = queries::update_message_content(&tx, &id, &content, &edited_at)?
                    .ok_or_else(|| DatabaseError::NotFound(format!("message {}", id)))?;
                search::sync_message(&tx, &id)?;
                queries::refresh_chat_summary(&tx, &chat_id)?;
                search::sync_chat(&tx, &chat_id)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn delete_message(&self, id: &str) -> DatabaseResult<bool> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(chat_id) = queries::delete_message(&tx, &id)? else {
                    return Ok(false);
                };
                queries::refresh_chat_summary(&tx, &chat_id)?;
                search::sync_chat(&tx, &chat_id)?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    // ==========================================
    // Search
    // ==========================================

    /// Chat ids matching `query`, best match first.
    pub async fn search_chats(&self, query: &str) -> DatabaseResult<Vec<String>> {
        let query = query.to_string();
        let limit = self.search_result_limit;
        self.readers
            .read(move |conn| search::search_chats(conn, &query, limit))
            .await
    }

    /// Message ids matching `query`, optionally within one chat.
    pub async fn search_messages(
        &self,
        query: &str,
        chat_id: Option<&str>,
    ) -> DatabaseResult<Vec<String>> {
        let query = query.to_string();
        let chat_id = chat_id.map(str::to_string);
        let limit = self.search_result_limit;
        self.readers
            .read(move |conn| search::search_messages(conn, &query, chat_id.as_deref(), limit))
            .await
    }

    pub async fn search_health(&self) -> DatabaseResult<SearchHealth> {
        self.readers.read(|conn| search::check_health(conn)).await
    }

    pub async fn rebuild_search_index(&self) -> DatabaseResult<RebuildStats> {
        self.db.call(|conn| search::rebuild(conn)).await
    }

    // ==========================================
    // Pagination, batches and maintenance
    // ==========================================

    pub async fn paginate_chats(
        &self,
        params: PaginationParams,
        filter: ChatFilter,
    ) -> DatabaseResult<PaginatedResult<Chat>> {
        self.optimizer.paginate_chats(params, filter).await
    }

    pub async fn paginate_messages(
        &self,
        params: PaginationParams,
        filter: MessageFilter,
    ) -> DatabaseResult<PaginatedResult<Message>> {
        self.optimizer
            .paginate_messages(params, filter)
            .await?
            .try_map(|r| self.open_record(r))
    }

    pub async fn batch_insert_chats(&self, chats: Vec<Chat>) -> BatchResult {
        self.optimizer.batch_insert_chats(chats).await
    }

    /// Insert messages in chunks. Messages whose attachment cannot be
    /// sealed are counted as failures and never reach the writer.
    pub async fn batch_insert_messages(&self, messages: Vec<Message>) -> BatchResult {
        let started = Instant::now();
        let mut rejected = BatchResult::default();
        let mut records = Vec::with_capacity(messages.len());

        for message in messages {
            let id = message.id.clone();
            match self.seal_message(message) {
                Ok(record) => records.push(record),
                Err(e) => rejected.fail(id, e.to_string()),
            }
        }

        let mut result = self.optimizer.batch_insert_messages(records).await;
        result.failure_count += rejected.failure_count;
        result.failures.extend(rejected.failures);
        result.elapsed = started.elapsed();
        result
    }

    pub async fn batch_delete_messages(&self, ids: Vec<String>) -> BatchResult {
        self.optimizer.batch_delete_messages(ids).await
    }

    pub async fn batch_delete_chats(&self, ids: Vec<String>) -> BatchResult {
        self.optimizer.batch_delete_chats(ids).await
    }

    pub async fn archive_old_chats(&self, options: ArchiveOptions) -> DatabaseResult<ArchiveReport> {
        self.optimizer.archive_old_chats(options).await
    }

    pub async fn cleanup_orphaned_data(&self) -> DatabaseResult<CleanupReport> {
        self.optimizer.cleanup_orphaned_data().await
    }

    pub async fn performance_metrics(&self) -> DatabaseResult<PerformanceMetrics> {
        self.optimizer.metrics().await
    }

    pub async fn optimize(&self) -> DatabaseResult<OptimizeReport> {
        self.optimizer.optimize().await
    }

    // ==========================================
    // Keys and security
    // ==========================================

    pub async fn encryption_status(&self) -> DatabaseResult<EncryptionStatus> {
        let metadata = self
            .readers
            .read(|conn| queries::get_encryption_metadata(conn))
            .await?;
        self.vault.encryption_status(metadata)
    }

    pub fn should_rotate_key(&self) -> DatabaseResult<bool> {
        self.vault.should_rotate(Utc::now())
    }

    /// Switch to a fresh key. Existing attachments stay readable through
    /// the retired key.
    pub async fn rotate_encryption_key(&self) -> DatabaseResult<KeyRotationRecord> {
        self.vault.rotate(&self.db).await
    }

    pub async fn key_rotation_history(&self) -> DatabaseResult<Vec<KeyRotationRecord>> {
        self.readers.read(|conn| queries::list_key_rotations(conn)).await
    }

    /// Security findings for the store file and its backups.
    pub fn validate_security(&self) -> SecurityReport {
        let mut report = self.vault.validate_security(self.db.path());

        match self.backups.list_backups() {
            Ok(backups) => report
                .warnings
                .extend(backups.iter().filter_map(|b| permission_warning(&b.path))),
            Err(e) => report.warnings.push(format!("Backups unreadable: {}", e)),
        }
        report
    }

    // ==========================================
    // Schema and backups
    // ==========================================

    pub async fn schema_version(&self) -> DatabaseResult<i64> {
        self.readers.read(|conn| migrations::current_version(conn)).await
    }

    pub async fn migration_history(&self) -> DatabaseResult<Vec<MigrationRecord>> {
        self.readers.read(|conn| migrations::history(conn)).await
    }

    /// Take a backup now, tagged with the current schema version.
    pub async fn create_backup(&self) -> DatabaseResult<PathBuf> {
        let backups = self.backups.clone();
        self.db
            .call(move |conn| {
                let version = migrations::current_version(conn)?;
                backups.create_backup(conn, version)
            })
            .await
    }

    /// Backups on disk, newest first.
    pub fn list_backups(&self) -> DatabaseResult<Vec<BackupInfo>> {
        self.backups.list_backups()
    }

    /// Flush and close the writer. Other clones stop working afterwards.
    pub async fn close(self) -> DatabaseResult<()> {
        info!(path = %self.db.path().display(), "Closing chat store");
        self.db.close().await
    }
}
