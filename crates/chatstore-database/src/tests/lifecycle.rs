//! Chat and message lifecycle, attachments, keys and reopening.

use super::{chat_with_messages, Harness};
use crate::backup::BackupManager;
use crate::migrations::MigrationEngine;
use crate::{
    Chat, ChatStore, DatabaseError, Message, MessageStatus, ResponseMetadata, PREVIEW_MAX_CHARS,
};
use chatstore_config_and_utils::Config;
use rusqlite::params;

#[tokio::test]
async fn message_round_trip_with_metadata() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Round trip", 0).await;

    let mut message = Message::new(&chat.id, "Here is the answer.", false);
    message.status = MessageStatus::Streaming;
    message.response_metadata = Some(ResponseMetadata {
        model: Some("gpt-4o".into()),
        prompt_tokens: Some(12),
        completion_tokens: Some(40),
        latency_ms: Some(850),
    });
    store.save_message(message.clone()).await.unwrap();

    let loaded = store.load_message(&message.id).await.unwrap().unwrap();
    assert_eq!(loaded, message);

    // Saving again updates in place.
    message.status = MessageStatus::Sent;
    store.save_message(message.clone()).await.unwrap();
    assert_eq!(store.load_messages(&chat.id).await.unwrap(), vec![message]);
    assert_eq!(store.load_chat(&chat.id).await.unwrap().unwrap().message_count, 1);
}

#[tokio::test]
async fn moving_message_refreshes_both_chats() {
    let harness = Harness::new();
    let store = harness.open().await;
    let source = chat_with_messages(&store, "Source", 0).await;
    let target = chat_with_messages(&store, "Target", 0).await;

    let mut message = Message::new(&source.id, "hello moved", true);
    store.save_message(message.clone()).await.unwrap();
    assert_eq!(store.search_chats("moved").await.unwrap(), vec![source.id.clone()]);

    message.chat_id = target.id.clone();
    store.save_message(message.clone()).await.unwrap();

    let source = store.load_chat(&source.id).await.unwrap().unwrap();
    assert_eq!(source.message_count, 0);
    assert_eq!(source.last_message_preview, None);
    assert!(store.load_messages(&source.id).await.unwrap().is_empty());

    let target = store.load_chat(&target.id).await.unwrap().unwrap();
    assert_eq!(target.message_count, 1);
    assert_eq!(target.last_message_preview.as_deref(), Some("hello moved"));

    assert_eq!(store.search_chats("moved").await.unwrap(), vec![target.id]);
    assert!(store.search_health().await.unwrap().is_healthy());
}

#[tokio::test]
async fn message_requires_existing_chat() {
    let harness = Harness::new();
    let store = harness.open().await;

    let err = store
        .save_message(Message::new("no-such-chat", "hello", true))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));
    assert!(store.load_messages("no-such-chat").await.unwrap().is_empty());
}

#[tokio::test]
async fn preview_is_truncated_newest_message() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Preview", 2).await;

    let long = "x".repeat(PREVIEW_MAX_CHARS + 30);
    store.save_message(Message::new(&chat.id, long, false)).await.unwrap();

    let loaded = store.load_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(loaded.message_count, 3);
    assert_eq!(loaded.last_message_preview.unwrap().chars().count(), PREVIEW_MAX_CHARS);
    assert!(loaded.updated_at >= loaded.created_at);
}

#[tokio::test]
async fn edit_updates_content_and_index() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Edits", 0).await;

    let message = Message::new(&chat.id, "original wording", true);
    store.save_message(message.clone()).await.unwrap();
    store
        .update_message_content(&message.id, "revised phrasing")
        .await
        .unwrap();

    let loaded = store.load_message(&message.id).await.unwrap().unwrap();
    assert_eq!(loaded.content, "revised phrasing");
    assert_eq!(loaded.status, MessageStatus::Edited);
    assert!(loaded.edited_at.is_some());

    assert!(store.search_messages("original", None).await.unwrap().is_empty());
    assert_eq!(
        store.search_messages("revised", Some(&chat.id)).await.unwrap(),
        vec![message.id.clone()]
    );
    assert!(store.search_messages("revised", Some("other")).await.unwrap().is_empty());

    let err = store.update_message_content("missing", "text").await.unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));
}

#[tokio::test]
async fn delete_message_refreshes_summary() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Deletes", 3).await;
    let messages = store.load_messages(&chat.id).await.unwrap();

    assert!(store.delete_message(&messages[2].id).await.unwrap());
    assert!(!store.delete_message(&messages[2].id).await.unwrap());

    let loaded = store.load_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(loaded.message_count, 2);
    assert_eq!(loaded.last_message_preview.as_deref(), Some(messages[1].content.as_str()));

    assert!(!store.delete_chat("missing").await.unwrap());
}

#[tokio::test]
async fn attachments_are_sealed_at_rest() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Images", 0).await;

    let plaintext = b"\x89PNG fake image bytes".to_vec();
    let mut message = Message::new(&chat.id, "see attached", true);
    message.attachment = Some(plaintext.clone());
    store.save_message(message.clone()).await.unwrap();

    let stored: Vec<u8> = harness
        .raw()
        .query_row(
            "SELECT attachment_ciphertext FROM messages WHERE id = ?1",
            params![message.id],
            |row| row.get(0),
        )
        .unwrap();
    assert_ne!(stored, plaintext);

    let loaded = store.load_message(&message.id).await.unwrap().unwrap();
    assert_eq!(loaded.attachment, Some(plaintext));
}

#[tokio::test]
async fn rotation_keeps_old_attachments_readable() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Rotation", 0).await;

    let mut before = Message::new(&chat.id, "before rotation", true);
    before.attachment = Some(b"old secret".to_vec());
    store.save_message(before.clone()).await.unwrap();

    let status = store.encryption_status().await.unwrap();
    assert!(status.is_encrypted);
    assert!(status.key_matches);
    assert!(!status.rotation_due);
    assert!(!store.should_rotate_key().unwrap());

    let rotation = store.rotate_encryption_key().await.unwrap();
    assert_eq!(Some(rotation.previous_key_hash.clone()), status.key_hash);
    assert_ne!(rotation.previous_key_hash, rotation.new_key_hash);

    let mut after = Message::new(&chat.id, "after rotation", false);
    after.attachment = Some(b"new secret".to_vec());
    store.save_message(after.clone()).await.unwrap();

    let loaded = store.load_messages(&chat.id).await.unwrap();
    assert_eq!(loaded[0].attachment.as_deref(), Some(&b"old secret"[..]));
    assert_eq!(loaded[1].attachment.as_deref(), Some(&b"new secret"[..]));

    let status = store.encryption_status().await.unwrap();
    assert_eq!(status.key_hash, Some(rotation.new_key_hash.clone()));
    assert!(status.key_matches);
    assert_eq!(store.key_rotation_history().await.unwrap(), vec![rotation]);

    // A reopened store resolves the retired key from the keychain.
    store.close().await.unwrap();
    let store = harness.open().await;
    let reloaded = store.load_message(&before.id).await.unwrap().unwrap();
    assert_eq!(reloaded.attachment.as_deref(), Some(&b"old secret"[..]));
}

#[tokio::test]
async fn open_store_passes_security_validation() {
    let harness = Harness::new();
    let store = harness.open().await;
    chat_with_messages(&store, "Secure", 1).await;

    let report = store.validate_security();
    assert!(report.is_secure(), "issues: {:?}", report.issues);
    assert!(!report.warnings.iter().any(|w| w.contains("overdue")));
}

#[tokio::test]
async fn lost_key_is_reported() {
    let mut harness = Harness::new();
    let store = harness.open().await;
    store.close().await.unwrap();

    harness.lose_keychain();
    let store = harness.open().await;

    let status = store.encryption_status().await.unwrap();
    assert!(status.is_encrypted);
    assert!(!status.key_matches);

    let report = store.validate_security();
    assert!(!report.is_secure());
    assert!(report.issues.iter().any(|i| i.contains("does not match")));
}

#[tokio::test]
async fn invalid_config_is_rejected_on_open() {
    let mut harness = Harness::new();

    harness.config.reader_pool_size = 0;
    let result =
        ChatStore::open_at(&harness.db_path(), &harness.backups_dir(), &harness.config, harness.key_store())
            .await;
    assert!(matches!(result.err(), Some(DatabaseError::InvalidData(_))));

    harness.config = Config::default();
    harness.config.key_rotation_interval_days = i64::MAX / 2;
    let result =
        ChatStore::open_at(&harness.db_path(), &harness.backups_dir(), &harness.config, harness.key_store())
            .await;
    assert!(matches!(result.err(), Some(DatabaseError::InvalidData(_))));

    // Nothing was created for a rejected config.
    assert!(!harness.db_path().exists());
}

#[tokio::test]
async fn reopen_preserves_data() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Persistent", 4).await;
    store.close().await.unwrap();

    let store = harness.open().await;
    assert_eq!(store.load_chats().await.unwrap(), vec![store.load_chat(&chat.id).await.unwrap().unwrap()]);
    assert_eq!(store.load_messages(&chat.id).await.unwrap().len(), 4);
    assert_eq!(store.search_chats("persistent").await.unwrap(), vec![chat.id]);
}

#[tokio::test]
async fn v1_store_is_upgraded_on_open() {
    let harness = Harness::new();
    std::fs::create_dir_all(harness.db_path().parent().unwrap()).unwrap();
    {
        let mut conn = harness.raw();
        let backups = BackupManager::for_database(&harness.db_path(), harness.backups_dir(), 5);
        MigrationEngine::default()
            .migrate_if_needed(&mut conn, 1, &backups)
            .unwrap();
        std::fs::remove_dir_all(harness.backups_dir()).unwrap();
    }

    let store = harness.open().await;
    assert_eq!(store.schema_version().await.unwrap(), crate::CURRENT_SCHEMA_VERSION);

    let versions: Vec<i64> = store
        .migration_history()
        .await
        .unwrap()
        .iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    let backups = store.list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].schema_version, 1);
}

#[tokio::test]
async fn newer_store_is_refused() {
    let harness = Harness::new();
    harness.open().await.close().await.unwrap();

    harness
        .raw()
        .execute(
            "INSERT INTO migration_records (version, description, applied_at, status)
             VALUES (99, 'from the future', '2030-01-01T00:00:00.000000Z', 'completed')",
            [],
        )
        .unwrap();

    let result =
        ChatStore::open_at(&harness.db_path(), &harness.backups_dir(), &harness.config, harness.key_store())
            .await;
    assert!(matches!(
        result.err(),
        Some(DatabaseError::InvalidSchemaVersion { current: 99, target: 3 })
    ));
}

#[tokio::test]
async fn damaged_index_is_rebuilt_on_open() {
    let harness = Harness::new();
    let store = harness.open().await;
    let chat = chat_with_messages(&store, "Indexed", 2).await;
    store.close().await.unwrap();

    harness.raw().execute_batch("DELETE FROM chats_search;").unwrap();

    let store = harness.open().await;
    assert!(store.search_health().await.unwrap().is_healthy());
    assert_eq!(store.search_chats("indexed").await.unwrap(), vec![chat.id]);
}

#[tokio::test]
async fn chats_list_newest_first() {
    let harness = Harness::new();
    let store = harness.open().await;

    let mut older = Chat::new("Older", "openai", "gpt-4o");
    older.created_at -= chrono::Duration::hours(2);
    older.updated_at -= chrono::Duration::hours(2);
    store.save_chat(older.clone()).await.unwrap();
    let newer = chat_with_messages(&store, "Newer", 1).await;

    let ids: Vec<String> = store.load_chats().await.unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
}
