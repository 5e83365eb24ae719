//! Full-text search shadow tables.
//!
//! `chats_search` holds one row per chat (title + preview) and
//! `messages_search` one row per message (content). Writers call the sync
//! functions inside the same transaction as the primary write; the delete
//! triggers in the schema cover removals. Queries are reduced to quoted
//! prefix terms, so user input never reaches the FTS5 query parser as syntax.

use crate::{schema, DatabaseResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Turn free text into an FTS5 match expression: every token becomes a
/// quoted prefix term and all terms must match. Tokens without letters or
/// digits are dropped. `None` when nothing searchable remains.
pub fn build_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|token| token.replace('"', ""))
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .map(|token| format!("\"{}\"*", token))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

// ==========================================
// Sync
// ==========================================

/// Re-derive the chat's search entry from its primary row. Removes the
/// entry if the chat no longer exists.
pub fn sync_chat(conn: &Connection, chat_id: &str) -> DatabaseResult<()> {
    conn.prepare_cached("DELETE FROM chats_search WHERE chat_id = ?1")?
        .execute(params![chat_id])?;
    conn.prepare_cached(
        "INSERT INTO chats_search (chat_id, content)
         SELECT id, title || ' ' || COALESCE(last_message_preview, '') FROM chats WHERE id = ?1",
    )?
    .execute(params![chat_id])?;
    Ok(())
}

/// Re-derive a message's search entry from its primary row.
pub fn sync_message(conn: &Connection, message_id: &str) -> DatabaseResult<()> {
    remove_message(conn, message_id)?;
    index_new_message(conn, message_id)
}

/// Add the entry for a message known to have none yet.
pub fn index_new_message(conn: &Connection, message_id: &str) -> DatabaseResult<()> {
    conn.prepare_cached(
        "INSERT INTO messages_search (message_id, chat_id, content)
         SELECT id, chat_id, content FROM messages WHERE id = ?1",
    )?
    .execute(params![message_id])?;
    Ok(())
}

pub fn remove_message(conn: &Connection, message_id: &str) -> DatabaseResult<()> {
    conn.prepare_cached("DELETE FROM messages_search WHERE message_id = ?1")?
        .execute(params![message_id])?;
    Ok(())
}

// ==========================================
// Queries
// ==========================================

/// Chat ids matching `query`, best match first.
pub fn search_chats(conn: &Connection, query: &str, limit: usize) -> DatabaseResult<Vec<String>> {
    let Some(expr) = build_match_query(query) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare_cached(
        "SELECT chat_id FROM chats_search
         WHERE chats_search MATCH ?1
         ORDER BY bm25(chats_search)
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![expr, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Message ids matching `query`, optionally within one chat, best match first.
pub fn search_messages(
    conn: &Connection,
    query: &str,
    chat_id: Option<&str>,
    limit: usize,
) -> DatabaseResult<Vec<String>> {
    let Some(expr) = build_match_query(query) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare_cached(
        "SELECT message_id FROM messages_search
         WHERE messages_search MATCH ?1
           AND (?2 IS NULL OR chat_id = ?2)
         ORDER BY bm25(messages_search)
         LIMIT ?3",
    )?;
    let ids = stmt
        .query_map(params![expr, chat_id, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ==========================================
// Health & maintenance
// ==========================================

/// Consistency between the shadow tables and primary rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHealth {
    pub tables_present: bool,
    pub chat_rows: i64,
    pub chat_entries: i64,
    pub message_rows: i64,
    pub message_entries: i64,
    /// Chats without a search entry.
    pub missing_chat_ids: Vec<String>,
    /// Search entries whose chat is gone.
    pub orphaned_chat_entries: Vec<String>,
    pub missing_message_ids: Vec<String>,
    pub orphaned_message_entries: Vec<String>,
}

impl SearchHealth {
    pub fn is_healthy(&self) -> bool {
        self.tables_present
            && self.chat_rows == self.chat_entries
            && self.message_rows == self.message_entries
            && self.missing_chat_ids.is_empty()
            && self.orphaned_chat_entries.is_empty()
            && self.missing_message_ids.is_empty()
            && self.orphaned_message_entries.is_empty()
    }
}

fn count(conn: &Connection, sql: &str) -> DatabaseResult<i64> {
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

fn ids(conn: &Connection, sql: &str) -> DatabaseResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn check_health(conn: &Connection) -> DatabaseResult<SearchHealth> {
    let tables_present = schema::table_exists(conn, "chats_search")?
        && schema::table_exists(conn, "messages_search")?;
    if !tables_present {
        return Ok(SearchHealth::default());
    }

    Ok(SearchHealth {
        tables_present,
        chat_rows: count(conn, "SELECT COUNT(*) FROM chats")?,
        chat_entries: count(conn, "SELECT COUNT(*) FROM chats_search")?,
        message_rows: count(conn, "SELECT COUNT(*) FROM messages")?,
        message_entries: count(conn, "SELECT COUNT(*) FROM messages_search")?,
        missing_chat_ids: ids(
            conn,
            "SELECT id FROM chats WHERE id NOT IN (SELECT chat_id FROM chats_search)",
        )?,
        orphaned_chat_entries: ids(
            conn,
            "SELECT chat_id FROM chats_search WHERE chat_id NOT IN (SELECT id FROM chats)",
        )?,
        missing_message_ids: ids(
            conn,
            "SELECT id FROM messages WHERE id NOT IN (SELECT message_id FROM messages_search)",
        )?,
        orphaned_message_entries: ids(
            conn,
            "SELECT message_id FROM messages_search WHERE message_id NOT IN (SELECT id FROM messages)",
        )?,
    })
}

/// Entries written by a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildStats {
    pub chat_entries: usize,
    pub message_entries: usize,
}

/// Drop and regenerate both shadow tables from primary data in one
/// transaction.
pub fn rebuild(conn: &mut Connection) -> DatabaseResult<RebuildStats> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "
        DROP TABLE IF EXISTS chats_search;
        DROP TABLE IF EXISTS messages_search;
        ",
    )?;
    schema::create_search_tables(&tx)?;

    let chat_entries = tx.execute(
        "INSERT INTO chats_search (chat_id, content)
         SELECT id, title || ' ' || COALESCE(last_message_preview, '') FROM chats",
        [],
    )?;
    let message_entries = tx.execute(
        "INSERT INTO messages_search (message_id, chat_id, content)
         SELECT id, chat_id, content FROM messages",
        [],
    )?;

    tx.commit()?;

    info!(chat_entries, message_entries, "Search index rebuilt");
    Ok(RebuildStats {
        chat_entries,
        message_entries,
    })
}

/// Remove search entries whose primary row is gone.
pub fn purge_orphans(conn: &Connection) -> DatabaseResult<usize> {
    let chats = conn.execute(
        "DELETE FROM chats_search WHERE chat_id NOT IN (SELECT id FROM chats)",
        [],
    )?;
    let messages = conn.execute(
        "DELETE FROM messages_search WHERE message_id NOT IN (SELECT id FROM messages)",
        [],
    )?;

    let purged = chats + messages;
    if purged > 0 {
        warn!(chats, messages, "Purged orphaned search entries");
    }
    Ok(purged)
}

/// Merge FTS5 b-tree segments.
pub fn optimize(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        INSERT INTO chats_search (chats_search) VALUES ('optimize');
        INSERT INTO messages_search (messages_search) VALUES ('optimize');
        ",
    )?;
    Ok(())
}
