//! Archival of stale chats.

use crate::queries::{self, format_timestamp, MESSAGE_PAYLOAD_BYTES};
use crate::{search, DatabaseError, DatabaseResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest message body kept when archived content is compressed.
pub const COMPRESSED_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOptions {
    /// Chats not updated for this many days are archived.
    pub older_than_days: i64,
    /// Newest messages kept per archived chat.
    pub keep_recent_messages_count: usize,
    /// Drop attachments of the kept messages.
    pub delete_images: bool,
    /// Collapse whitespace and truncate the kept messages.
    pub compress_content: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            older_than_days: 90,
            keep_recent_messages_count: 50,
            delete_images: false,
            compress_content: false,
        }
    }
}

impl ArchiveOptions {
    /// Chats last updated before the returned instant are archived.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DatabaseResult<DateTime<Utc>> {
        if self.older_than_days <= 0 {
            return Err(DatabaseError::InvalidData(format!(
                "older_than_days must be positive, got {}",
                self.older_than_days
            )));
        }
        chrono::Duration::try_days(self.older_than_days)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| {
                DatabaseError::InvalidData(format!(
                    "older_than_days out of range: {}",
                    self.older_than_days
                ))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub archived_chats: usize,
    /// Messages deleted while trimming archived chats.
    pub trimmed_messages: usize,
    pub freed_bytes: u64,
    pub elapsed: Duration,
    pub archived_chat_ids: Vec<String>,
}

/// What archiving one chat did.
#[derive(Debug, Default)]
pub(crate) struct ChatArchiveOutcome {
    pub trimmed: usize,
    pub freed_bytes: u64,
}

/// Collapse runs of whitespace and cap the length.
pub fn compress_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(COMPRESSED_MAX_CHARS)
        .collect()
}

/// Unarchived chats last updated before `cutoff`, oldest first.
pub(crate) fn find_candidates(conn: &Connection, cutoff: &DateTime<Utc>) -> DatabaseResult<Vec<String>> {
    let ids = conn
        .prepare_cached(
            "SELECT id FROM chats WHERE is_archived = 0 AND updated_at < ?1 ORDER BY updated_at ASC, id ASC",
        )?
        .query_map(params![format_timestamp(cutoff)], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn payload_bytes(conn: &Connection, chat_id: &str) -> DatabaseResult<u64> {
    let bytes: i64 = conn.query_row(
        &format!("SELECT COALESCE(SUM({MESSAGE_PAYLOAD_BYTES}), 0) FROM messages WHERE chat_id = ?1"),
        params![chat_id],
        |row| row.get(0),
    )?;
    Ok(bytes.max(0) as u64)
}

fn compress_messages(conn: &Connection, chat_id: &str) -> DatabaseResult<()> {
    let rows = conn
        .prepare_cached("SELECT id, content FROM messages WHERE chat_id = ?1")?
        .query_map(params![chat_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, content) in rows {
        let compressed = compress_text(&content);
        if compressed != content {
            conn.execute("UPDATE messages SET content = ?2 WHERE id = ?1", params![id, compressed])?;
            search::sync_message(conn, &id)?;
        }
    }
    Ok(())
}

/// Archive one chat in its own transaction.
///
/// Returns `None` when the chat is gone or no longer qualifies.
pub(crate) fn archive_chat(
    conn: &mut Connection,
    chat_id: &str,
    cutoff: &DateTime<Utc>,
    options: &ArchiveOptions,
    archived_at: &DateTime<Utc>,
) -> DatabaseResult<Option<ChatArchiveOutcome>> {
    let tx = conn.transaction()?;

    let qualifies: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM chats WHERE id = ?1 AND is_archived = 0 AND updated_at < ?2)",
        params![chat_id, format_timestamp(cutoff)],
        |row| row.get(0),
    )?;
    if !qualifies {
        return Ok(None);
    }

    let before = payload_bytes(&tx, chat_id)?;

    let trimmed = tx.execute(
        "DELETE FROM messages WHERE chat_id = ?1 AND id NOT IN (
            SELECT id FROM messages WHERE chat_id = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
         )",
        params![chat_id, options.keep_recent_messages_count as i64],
    )?;

    if options.delete_images {
        tx.execute(
            "UPDATE messages SET attachment_ciphertext = NULL, attachment_nonce = NULL, attachment_key_hash = NULL
             WHERE chat_id = ?1 AND attachment_ciphertext IS NOT NULL",
            params![chat_id],
        )?;
    }

    if options.compress_content {
        compress_messages(&tx, chat_id)?;
    }

    tx.execute(
        "UPDATE chats SET is_archived = 1, archived_at = ?2 WHERE id = ?1",
        params![chat_id, format_timestamp(archived_at)],
    )?;
    queries::refresh_chat_summary(&tx, chat_id)?;
    search::sync_chat(&tx, chat_id)?;

    let after = payload_bytes(&tx, chat_id)?;
    tx.commit()?;

    Ok(Some(ChatArchiveOutcome {
        trimmed,
        freed_bytes: before.saturating_sub(after),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_collapses_whitespace() {
        assert_eq!(compress_text("  a\n\n b\t c  "), "a b c");
        assert_eq!(compress_text(""), "");
    }

    #[test]
    fn compress_truncates_by_chars() {
        let long = "é".repeat(COMPRESSED_MAX_CHARS + 20);
        let compressed = compress_text(&long);
        assert_eq!(compressed.chars().count(), COMPRESSED_MAX_CHARS);
    }

    #[test]
    fn default_options() {
        let options = ArchiveOptions::default();
        assert_eq!(options.older_than_days, 90);
        assert_eq!(options.keep_recent_messages_count, 50);
        assert!(!options.delete_images);
        assert!(!options.compress_content);
    }

    #[test]
    fn cutoff_rejects_out_of_range_ages() {
        let now = crate::models::now();
        let options = |days| ArchiveOptions {
            older_than_days: days,
            ..ArchiveOptions::default()
        };

        assert_eq!(options(30).cutoff(now).unwrap(), now - chrono::Duration::days(30));
        for days in [0, -5, i64::MAX / 2, i64::MAX] {
            assert!(
                matches!(options(days).cutoff(now), Err(DatabaseError::InvalidData(_))),
                "accepted {days}"
            );
        }
    }
}
