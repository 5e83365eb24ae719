//! End-to-end walkthroughs.

use super::Harness;
use crate::backup::BackupManager;
use crate::migrations::{self, MigrationEngine, MigrationOutcome};
use crate::schema;
use crate::{
    models, ArchiveOptions, Chat, ChatFilter, Message, MessageStatus, PaginationParams,
    BASELINE_DESCRIPTION,
};
use chrono::Duration;
use rusqlite::{params, Connection};
use tempfile::tempdir;

#[test]
fn fresh_store_migrates_to_v1() {
    let dir = tempdir().unwrap();
    let mut conn = Connection::open(dir.path().join("fresh.sqlite")).unwrap();
    let backups = BackupManager::new(dir.path().join("backups"), "fresh", 5);

    assert_eq!(migrations::current_version(&conn).unwrap(), 0);

    let outcome = MigrationEngine::default()
        .migrate_if_needed(&mut conn, 1, &backups)
        .unwrap();
    assert!(matches!(
        outcome,
        MigrationOutcome::Migrated { from_version: 0, to_version: 1, .. }
    ));

    assert_eq!(migrations::current_version(&conn).unwrap(), 1);
    let records = migrations::history(&conn).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].description, BASELINE_DESCRIPTION);
    assert_eq!(records[0].description, "Initial schema creation");

    for table in ["chats", "messages", "encryption_metadata", "chats_search", "messages_search"] {
        assert!(schema::table_exists(&conn, table).unwrap(), "missing {table}");
    }
}

#[tokio::test]
async fn search_finds_chat_by_title() {
    let harness = Harness::new();
    let store = harness.open().await;

    let mut chat = Chat::new("Machine Learning Discussion", "openai", "gpt-4o");
    chat.last_message_preview = Some("neural networks".to_string());
    store.save_chat(chat.clone()).await.unwrap();
    store.save_chat(Chat::new("Dinner recipes", "openai", "gpt-4o")).await.unwrap();

    assert_eq!(store.search_chats("machine").await.unwrap(), vec![chat.id.clone()]);
    assert_eq!(store.search_chats("neural").await.unwrap(), vec![chat.id]);
    assert!(store.search_chats("").await.unwrap().is_empty());
    assert!(store.search_chats("   ").await.unwrap().is_empty());
}

#[tokio::test]
async fn paginate_150_chats() {
    let harness = Harness::new();
    let store = harness.open().await;

    let chats: Vec<Chat> = (0..150)
        .map(|i| Chat::new(format!("Chat {i}"), "openai", "gpt-4o"))
        .collect();
    let result = store.batch_insert_chats(chats).await;
    assert!(result.is_complete_success());

    let first = store
        .paginate_chats(PaginationParams::new(0, 50), ChatFilter::default())
        .await
        .unwrap();
    assert_eq!(first.items.len(), 50);
    assert_eq!(first.total_count, 150);
    assert!(first.has_more);
    assert_eq!(first.next_offset, 50);

    let last = store
        .paginate_chats(PaginationParams::new(100, 50), ChatFilter::default())
        .await
        .unwrap();
    assert_eq!(last.items.len(), 50);
    assert_eq!(last.total_count, 150);
    assert!(!last.has_more);
    assert_eq!(last.next_offset, 150);
}

#[tokio::test]
async fn batch_insert_1000_messages() {
    let harness = Harness::with_batch_size(200);
    let store = harness.open().await;
    assert_eq!(store.optimizer().batch_size(), 200);

    let chat = Chat::new("Bulk", "openai", "gpt-4o");
    store.save_chat(chat.clone()).await.unwrap();

    let messages: Vec<Message> = (0..1000)
        .map(|i| Message::new(&chat.id, format!("bulk message {i}"), i % 2 == 0))
        .collect();
    let result = store.batch_insert_messages(messages).await;

    assert_eq!(result.success_count, 1000);
    assert_eq!(result.failure_count, 0);
    assert!(result.is_complete_success());

    let metrics = store.performance_metrics().await.unwrap();
    assert_eq!(metrics.message_count, 1000);
    let stored = store.load_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(stored.message_count, 1000);
}

#[tokio::test]
async fn archive_keeps_recent_messages() {
    let harness = Harness::new();
    let store = harness.open().await;

    let long_ago = models::now() - Duration::days(100);
    let mut chat = Chat::new("Old conversation", "openai", "gpt-4o");
    chat.created_at = long_ago;
    chat.updated_at = long_ago;
    store.save_chat(chat.clone()).await.unwrap();

    let messages: Vec<Message> = (0..150)
        .map(|i| {
            let mut message = Message::new(&chat.id, format!("old message {i}"), i % 2 == 0);
            message.timestamp = long_ago + Duration::seconds(i);
            message
        })
        .collect();
    assert!(store.batch_insert_messages(messages).await.is_complete_success());

    let report = store
        .archive_old_chats(ArchiveOptions {
            older_than_days: 90,
            keep_recent_messages_count: 50,
            ..ArchiveOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(report.archived_chats, 1);
    assert_eq!(report.trimmed_messages, 100);
    assert!(report.freed_bytes > 0);
    assert_eq!(report.archived_chat_ids, vec![chat.id.clone()]);

    let archived = store.load_chat(&chat.id).await.unwrap().unwrap();
    assert!(archived.is_archived);
    assert!(archived.archived_at.is_some());
    assert_eq!(archived.message_count, 50);

    let remaining = store.load_messages(&chat.id).await.unwrap();
    assert_eq!(remaining.len(), 50);
    assert_eq!(remaining[0].content, "old message 100");
    assert_eq!(remaining[49].content, "old message 149");
    assert!(store.search_health().await.unwrap().is_healthy());
}

#[tokio::test]
async fn cleanup_removes_orphans() {
    let harness = Harness::new();
    let store = harness.open().await;
    let kept = super::chat_with_messages(&store, "Keeper", 3).await;

    let ghost_chat = "ghost-chat";
    {
        let conn = harness.raw();
        let ts = crate::queries::format_timestamp(&models::now());
        for i in 0..25 {
            conn.execute(
                "INSERT INTO messages (id, chat_id, content, is_from_user, timestamp, status)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                params![
                    format!("orphan-{i}"),
                    ghost_chat,
                    format!("lost message {i}"),
                    ts,
                    MessageStatus::Sent.as_str()
                ],
            )
            .unwrap();
        }
    }

    let report = store.cleanup_orphaned_data().await.unwrap();
    assert_eq!(report.deleted_records, 25);
    assert!(report.freed_bytes > 0);

    assert!(store.load_messages(ghost_chat).await.unwrap().is_empty());
    assert_eq!(store.load_messages(&kept.id).await.unwrap().len(), 3);
    assert_eq!(store.optimizer().orphan_count().await.unwrap(), 0);
}
