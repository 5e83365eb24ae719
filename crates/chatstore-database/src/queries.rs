//! Standalone query functions for chats, messages and encryption metadata.
//!
//! Each function takes a `&Connection` (a transaction derefs to one), so the
//! same code runs on the writer and on pooled readers. Search shadow upkeep
//! lives in [`crate::search`]; callers pair the two inside one transaction.

use crate::{
    Chat, DatabaseError, DatabaseResult, EncryptionMetadata, KeyRotationRecord, MessageRecord,
    MessageStatus, ResponseMetadata, SealedAttachment, PREVIEW_MAX_CHARS,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

/// Column list matching [`chat_from_row`].
pub(crate) const CHAT_COLUMNS: &str = "id, title, created_at, updated_at, provider, model, \
     is_archived, archived_at, message_count, last_message_preview";

/// Column list matching [`message_from_row`].
pub(crate) const MESSAGE_COLUMNS: &str = "id, chat_id, content, is_from_user, timestamp, status, \
     edited_at, response_metadata, attachment_ciphertext, attachment_nonce, attachment_key_hash";

/// Bytes a message row occupies in payload columns.
pub(crate) const MESSAGE_PAYLOAD_BYTES: &str = "length(CAST(content AS BLOB)) \
     + COALESCE(length(attachment_ciphertext), 0) \
     + COALESCE(length(attachment_nonce), 0) \
     + COALESCE(length(response_metadata), 0)";

// ==========================================
// Timestamps
// ==========================================

/// Fixed-width RFC 3339 (microseconds, `Z`), so text order is time order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn read_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw, idx)
}

pub(crate) fn read_optional_timestamp(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_timestamp(&raw, idx).map(Some),
        None => Ok(None),
    }
}

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_error(idx: usize, e: DatabaseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

// ==========================================
// Row mapping
// ==========================================

pub(crate) fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: read_timestamp(row, 2)?,
        updated_at: read_timestamp(row, 3)?,
        provider: row.get(4)?,
        model: row.get(5)?,
        is_archived: row.get(6)?,
        archived_at: read_optional_timestamp(row, 7)?,
        message_count: row.get(8)?,
        last_message_preview: row.get(9)?,
    })
}

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let status: String = row.get(5)?;
    let metadata: Option<String> = row.get(7)?;
    let ciphertext: Option<Vec<u8>> = row.get(8)?;
    let nonce: Option<Vec<u8>> = row.get(9)?;
    let key_hash: Option<String> = row.get(10)?;

    let attachment = match (ciphertext, nonce, key_hash) {
        (Some(ciphertext), Some(nonce), Some(key_hash)) => Some(SealedAttachment {
            ciphertext,
            nonce,
            key_hash,
        }),
        (None, None, None) => None,
        _ => {
            return Err(conversion_error(
                8,
                DatabaseError::InvalidData("Incomplete attachment columns".to_string()),
            ))
        }
    };

    Ok(MessageRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        content: row.get(2)?,
        is_from_user: row.get(3)?,
        timestamp: read_timestamp(row, 4)?,
        status: status.parse().map_err(|e| conversion_error(5, e))?,
        edited_at: read_optional_timestamp(row, 6)?,
        response_metadata: metadata
            .map(|json| serde_json::from_str::<ResponseMetadata>(&json))
            .transpose()
            .map_err(|e| conversion_error(7, e.into()))?,
        attachment,
    })
}

// ==========================================
// Chats
// ==========================================

/// Insert a chat, or update everything but `created_at` if it exists.
pub fn upsert_chat(conn: &Connection, chat: &Chat) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO chats (id, title, created_at, updated_at, provider, model, is_archived, archived_at, message_count, last_message_preview)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            updated_at = excluded.updated_at,
            provider = excluded.provider,
            model = excluded.model,
            is_archived = excluded.is_archived,
            archived_at = excluded.archived_at,
            message_count = excluded.message_count,
            last_message_preview = excluded.last_message_preview",
        params![
            chat.id,
            chat.title,
            format_timestamp(&chat.created_at),
            format_timestamp(&chat.updated_at),
            chat.provider,
            chat.model,
            chat.is_archived,
            chat.archived_at.as_ref().map(format_timestamp),
            chat.message_count,
            chat.last_message_preview,
        ],
    )?;
    Ok(())
}

/// Insert a new chat. Fails if the id is taken.
pub fn insert_chat(conn: &Connection, chat: &Chat) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO chats (id, title, created_at, updated_at, provider, model, is_archived, archived_at, message_count, last_message_preview)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            chat.id,
            chat.title,
            format_timestamp(&chat.created_at),
            format_timestamp(&chat.updated_at),
            chat.provider,
            chat.model,
            chat.is_archived,
            chat.archived_at.as_ref().map(format_timestamp),
            chat.message_count,
            chat.last_message_preview,
        ],
    )?;
    Ok(())
}

/// Get a chat by ID.
pub fn get_chat(conn: &Connection, id: &str) -> DatabaseResult<Option<Chat>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"))?;

    match stmt.query_row(params![id], chat_from_row) {
        Ok(chat) => Ok(Some(chat)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All chats, most recently updated first.
pub fn list_chats(conn: &Connection) -> DatabaseResult<Vec<Chat>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats ORDER BY updated_at DESC, id ASC"
    ))?;

    let chats = stmt
        .query_map([], chat_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(chats)
}

pub fn chat_exists(conn: &Connection, id: &str) -> DatabaseResult<bool> {
    let exists: bool = conn
        .prepare_cached("SELECT EXISTS(SELECT 1 FROM chats WHERE id = ?1)")?
        .query_row(params![id], |row| row.get(0))?;
    Ok(exists)
}

/// Delete a chat. Its messages and search entries go with it via triggers.
pub fn delete_chat(conn: &Connection, id: &str) -> DatabaseResult<bool> {
    let rows = conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Recompute `message_count`, `last_message_preview` and `updated_at` from
/// the chat's messages.
pub fn refresh_chat_summary(conn: &Connection, chat_id: &str) -> DatabaseResult<bool> {
    let rows = conn.execute(
        "UPDATE chats SET
            message_count = (SELECT COUNT(*) FROM messages WHERE chat_id = ?1),
            last_message_preview = (
                SELECT substr(content, 1, ?2) FROM messages
                WHERE chat_id = ?1
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
            ),
            updated_at = MAX(updated_at, COALESCE(
                (SELECT MAX(timestamp) FROM messages WHERE chat_id = ?1),
                updated_at
            ))
         WHERE id = ?1",
        params![chat_id, PREVIEW_MAX_CHARS as i64],
    )?;
    Ok(rows > 0)
}

// ==========================================
// Messages
// ==========================================

fn message_params(message: &MessageRecord) -> DatabaseResult<[Box<dyn rusqlite::ToSql>; 11]> {
    let metadata = message
        .response_metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let (ciphertext, nonce, key_hash) = match &message.attachment {
        Some(a) => (Some(a.ciphertext.clone()), Some(a.nonce.clone()), Some(a.key_hash.clone())),
        None => (None, None, None),
    };

    Ok([
        Box::new(message.id.clone()),
        Box::new(message.chat_id.clone()),
        Box::new(message.content.clone()),
        Box::new(message.is_from_user),
        Box::new(format_timestamp(&message.timestamp)),
        Box::new(message.status.as_str()),
        Box::new(message.edited_at.as_ref().map(format_timestamp)),
        Box::new(metadata),
        Box::new(ciphertext),
        Box::new(nonce),
        Box::new(key_hash),
    ])
}

/// Insert a new message. Fails if the id is taken.
pub fn insert_message(conn: &Connection, message: &MessageRecord) -> DatabaseResult<()> {
    let values = message_params(message)?;
    conn.prepare_cached(&format!(
        "INSERT INTO messages ({MESSAGE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
    ))?
    .execute(rusqlite::params_from_iter(values.iter()))?;
    Ok(())
}

/// Insert a message or replace every column of an existing one.
pub fn upsert_message(conn: &Connection, message: &MessageRecord) -> DatabaseResult<()> {
    let values = message_params(message)?;
    conn.prepare_cached(&format!(
        "INSERT INTO messages ({MESSAGE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            chat_id = excluded.chat_id,
            content = excluded.content,
            is_from_user = excluded.is_from_user,
            timestamp = excluded.timestamp,
            status = excluded.status,
            edited_at = excluded.edited_at,
            response_metadata = excluded.response_metadata,
            attachment_ciphertext = excluded.attachment_ciphertext,
            attachment_nonce = excluded.attachment_nonce,
            attachment_key_hash = excluded.attachment_key_hash"
    ))?
    .execute(rusqlite::params_from_iter(values.iter()))?;
    Ok(())
}

/// The chat a stored message currently belongs to.
pub fn message_chat_id(conn: &Connection, id: &str) -> DatabaseResult<Option<String>> {
    let chat_id = conn
        .prepare_cached("SELECT chat_id FROM messages WHERE id = ?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?;
    Ok(chat_id)
}

/// Get a message by ID.
pub fn get_message(conn: &Connection, id: &str) -> DatabaseResult<Option<MessageRecord>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;

    stmt.query_row(params![id], message_from_row)
        .optional()
        .map_err(Into::into)
}

/// Messages of one chat in conversation order.
pub fn list_messages(conn: &Connection, chat_id: &str) -> DatabaseResult<Vec<MessageRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE chat_id = ?1
         ORDER BY timestamp ASC, id ASC"
    ))?;

    let messages = stmt
        .query_map(params![chat_id], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Replace a message's text and mark it edited. Returns the owning chat id.
pub fn update_message_content(
    conn: &Connection,
    id: &str,
    content: &str,
    edited_at: &DateTime<Utc>,
) -> DatabaseResult<Option<String>> {
    let chat_id = conn
        .query_row(
            "UPDATE messages SET content = ?2, status = ?3, edited_at = ?4
             WHERE id = ?1
             RETURNING chat_id",
            params![id, content, MessageStatus::Edited.as_str(), format_timestamp(edited_at)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(chat_id)
}

/// Delete a message. Returns the chat id it belonged to.
pub fn delete_message(conn: &Connection, id: &str) -> DatabaseResult<Option<String>> {
    let chat_id = conn
        .query_row(
            "DELETE FROM messages WHERE id = ?1 RETURNING chat_id",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(chat_id)
}

pub fn count_messages(conn: &Connection, chat_id: &str) -> DatabaseResult<i64> {
    let count = conn
        .prepare_cached("SELECT COUNT(*) FROM messages WHERE chat_id = ?1")?
        .query_row(params![chat_id], |row| row.get(0))?;
    Ok(count)
}

// ==========================================
// Encryption metadata
// ==========================================

pub fn get_encryption_metadata(conn: &Connection) -> DatabaseResult<Option<EncryptionMetadata>> {
    conn.query_row(
        "SELECT key_hash, encrypted_at FROM encryption_metadata WHERE id = 1",
        [],
        |row| {
            Ok(EncryptionMetadata {
                key_hash: row.get(0)?,
                encrypted_at: read_timestamp(row, 1)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Record `key_hash` as the active key if no key is registered yet.
/// Returns true when a row was written.
pub fn register_encryption_metadata(
    conn: &Connection,
    key_hash: &str,
    at: &DateTime<Utc>,
) -> DatabaseResult<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO encryption_metadata (id, key_hash, encrypted_at) VALUES (1, ?1, ?2)",
        params![key_hash, format_timestamp(at)],
    )?;
    Ok(rows > 0)
}

/// Point the metadata at a new key and append the rotation to the history.
pub fn record_key_rotation(conn: &Connection, rotation: &KeyRotationRecord) -> DatabaseResult<()> {
    let rotated_at = format_timestamp(&rotation.rotated_at);
    conn.execute(
        "INSERT INTO encryption_metadata (id, key_hash, encrypted_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET key_hash = excluded.key_hash, encrypted_at = excluded.encrypted_at",
        params![rotation.new_key_hash, rotated_at],
    )?;
    conn.execute(
        "INSERT INTO key_rotation_history (previous_key_hash, new_key_hash, rotated_at)
         VALUES (?1, ?2, ?3)",
        params![rotation.previous_key_hash, rotation.new_key_hash, rotated_at],
    )?;
    debug!(new_key_hash = %rotation.new_key_hash, "Key rotation recorded");
    Ok(())
}

/// Rotation history, oldest first.
pub fn list_key_rotations(conn: &Connection) -> DatabaseResult<Vec<KeyRotationRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT previous_key_hash, new_key_hash, rotated_at FROM key_rotation_history ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(KeyRotationRecord {
                previous_key_hash: row.get(0)?,
                new_key_hash: row.get(1)?,
                rotated_at: read_timestamp(row, 2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
