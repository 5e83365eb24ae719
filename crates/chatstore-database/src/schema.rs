//! Tables, indexes, triggers and search shadow tables.
//!
//! `create_baseline` lays down the version 1 schema; later versions are
//! applied by the migration registry. Every statement is `IF NOT EXISTS` so
//! re-running it is harmless.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::debug;

/// Schema version produced by running every registered migration.
pub const CURRENT_SCHEMA_VERSION: i64 = 3;

/// Tables that must exist at [`CURRENT_SCHEMA_VERSION`].
pub const REQUIRED_TABLES: &[&str] = &[
    "chats",
    "messages",
    "encryption_metadata",
    "key_rotation_history",
    "migration_records",
    "chats_search",
    "messages_search",
];

/// Indexes that must exist at [`CURRENT_SCHEMA_VERSION`].
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_chats_updated_at",
    "idx_chats_provider",
    "idx_chats_is_archived",
    "idx_chats_archived_at",
    "idx_messages_chat_timestamp",
    "idx_messages_timestamp",
];

/// Version 1: primary tables, encryption metadata, search shadows and the
/// delete triggers that keep them consistent.
pub fn create_baseline(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            is_archived INTEGER NOT NULL DEFAULT 0,
            message_count INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0),
            last_message_preview TEXT,
            CHECK (updated_at >= created_at)
        );

        CREATE INDEX IF NOT EXISTS idx_chats_updated_at ON chats(updated_at);
        CREATE INDEX IF NOT EXISTS idx_chats_provider ON chats(provider);
        CREATE INDEX IF NOT EXISTS idx_chats_is_archived ON chats(is_archived);
        ",
    )?;

    // chat_id carries no foreign key: orphans are detected and removed by
    // the cleanup pass instead of being rejected at write time.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY NOT NULL,
            chat_id TEXT NOT NULL,
            content TEXT NOT NULL,
            is_from_user INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'sent',
            edited_at TEXT,
            response_metadata TEXT,
            attachment_ciphertext BLOB,
            attachment_nonce BLOB,
            attachment_key_hash TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp ON messages(chat_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        ",
    )?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS encryption_metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            key_hash TEXT NOT NULL,
            encrypted_at TEXT NOT NULL
        );
        ",
    )?;

    create_search_tables(conn)?;

    conn.execute_batch(
        "
        CREATE TRIGGER IF NOT EXISTS trg_chats_after_delete
        AFTER DELETE ON chats
        BEGIN
            DELETE FROM messages WHERE chat_id = OLD.id;
            DELETE FROM chats_search WHERE chat_id = OLD.id;
        END;

        CREATE TRIGGER IF NOT EXISTS trg_messages_after_delete
        AFTER DELETE ON messages
        BEGIN
            DELETE FROM messages_search WHERE message_id = OLD.id;
        END;
        ",
    )?;

    debug!("Baseline schema created");
    Ok(())
}

/// FTS5 shadow tables. Also used by the search index rebuild.
pub fn create_search_tables(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS chats_search USING fts5(
            chat_id UNINDEXED,
            content
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_search USING fts5(
            message_id UNINDEXED,
            chat_id UNINDEXED,
            content
        );
        ",
    )?;
    Ok(())
}

pub fn table_exists(conn: &Connection, name: &str) -> DatabaseResult<bool> {
    object_exists(conn, "table", name)
}

fn object_exists(conn: &Connection, kind: &str, name: &str) -> DatabaseResult<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
        [kind, name],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// List required objects missing from the current schema. Empty means valid.
pub fn validate(conn: &Connection) -> DatabaseResult<Vec<String>> {
    let mut issues = Vec::new();

    for table in REQUIRED_TABLES {
        if !table_exists(conn, table)? {
            issues.push(format!("missing table {}", table));
        }
    }
    for index in REQUIRED_INDEXES {
        if !object_exists(conn, "index", index)? {
            issues.push(format!("missing index {}", index));
        }
    }

    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_baseline(&conn).unwrap();
        create_baseline(&conn).unwrap();

        for table in ["chats", "messages", "encryption_metadata", "chats_search", "messages_search"] {
            assert!(table_exists(&conn, table).unwrap(), "{table} missing");
        }
    }

    #[test]
    fn baseline_alone_fails_validation() {
        let conn = Connection::open_in_memory().unwrap();
        create_baseline(&conn).unwrap();

        let issues = validate(&conn).unwrap();
        assert!(issues.contains(&"missing table key_rotation_history".to_string()));
        assert!(issues.contains(&"missing index idx_chats_archived_at".to_string()));
        assert!(!issues.iter().any(|i| i.contains("messages_search")));
    }

    #[test]
    fn deleting_chat_cascades_through_trigger() {
        let conn = Connection::open_in_memory().unwrap();
        create_baseline(&conn).unwrap();
        conn.execute_batch(
            "
            INSERT INTO chats (id, title, created_at, updated_at, provider, model)
                VALUES ('c1', 't', '2024-01-01', '2024-01-01', 'p', 'm');
            INSERT INTO messages (id, chat_id, content, is_from_user, timestamp)
                VALUES ('m1', 'c1', 'hello', 1, '2024-01-01');
            INSERT INTO chats_search (chat_id, content) VALUES ('c1', 't');
            INSERT INTO messages_search (message_id, chat_id, content) VALUES ('m1', 'c1', 'hello');
            DELETE FROM chats WHERE id = 'c1';
            ",
        )
        .unwrap();

        for table in ["messages", "chats_search", "messages_search"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} not emptied");
        }
    }

    #[test]
    fn updated_before_created_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        create_baseline(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO chats (id, title, created_at, updated_at, provider, model)
             VALUES ('c1', 't', '2024-02-01', '2024-01-01', 'p', 'm')",
            [],
        );
        assert!(result.is_err());
    }
}
