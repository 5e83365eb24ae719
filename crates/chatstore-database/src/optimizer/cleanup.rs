//! Removal of messages whose chat no longer exists.

use crate::queries::MESSAGE_PAYLOAD_BYTES;
use crate::DatabaseResult;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Orphaned messages deleted.
    pub deleted_records: usize,
    pub freed_bytes: u64,
    /// Search entries without a primary row that were dropped.
    pub purged_search_entries: usize,
    pub elapsed: Duration,
}

/// Delete up to `limit` orphaned messages in one transaction.
///
/// Returns the number deleted and their payload size. Zero means done.
pub(crate) fn delete_orphan_chunk(conn: &mut Connection, limit: usize) -> DatabaseResult<(usize, u64)> {
    let tx = conn.transaction()?;

    let orphans = tx
        .prepare(&format!(
            "SELECT id, {MESSAGE_PAYLOAD_BYTES} FROM messages m
             WHERE NOT EXISTS (SELECT 1 FROM chats c WHERE c.id = m.chat_id)
             LIMIT ?1"
        ))?
        .query_map(params![limit as i64], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut deleted = 0;
    let mut freed = 0u64;
    {
        let mut stmt = tx.prepare_cached("DELETE FROM messages WHERE id = ?1")?;
        for (id, bytes) in &orphans {
            deleted += stmt.execute(params![id])?;
            freed += (*bytes).max(0) as u64;
        }
    }

    tx.commit()?;
    Ok((deleted, freed))
}

/// Number of orphaned messages.
pub(crate) fn count_orphans(conn: &Connection) -> DatabaseResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages m WHERE NOT EXISTS (SELECT 1 FROM chats c WHERE c.id = m.chat_id)",
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as usize)
}
