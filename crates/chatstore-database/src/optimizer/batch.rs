//! Chunked batch mutations.
//!
//! Each chunk is one transaction and each item gets its own savepoint, so a
//! bad item rolls back alone and is counted instead of raised. If the
//! transaction itself is lost the whole chunk fails; later chunks still run.

use crate::{queries, search, Chat, DatabaseError, DatabaseResult, MessageRecord};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// One item that did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub elapsed: Duration,
    pub failures: Vec<BatchItemFailure>,
}

impl BatchResult {
    pub fn is_complete_success(&self) -> bool {
        self.failure_count == 0
    }

    pub(crate) fn absorb(&mut self, chunk: ChunkOutcome) {
        self.success_count += chunk.succeeded;
        self.failure_count += chunk.failures.len();
        self.failures.extend(chunk.failures);
    }

    pub(crate) fn fail(&mut self, id: String, reason: String) {
        self.failure_count += 1;
        self.failures.push(BatchItemFailure { id, reason });
    }
}

/// Result of one chunk transaction.
#[derive(Debug, Default)]
pub(crate) struct ChunkOutcome {
    pub succeeded: usize,
    pub failures: Vec<BatchItemFailure>,
}

/// Run one item under a savepoint. Returns `Err` only when the enclosing
/// transaction is gone and the chunk cannot continue.
fn apply_item<T>(
    tx: &mut Transaction<'_>,
    outcome: &mut ChunkOutcome,
    id: &str,
    f: impl FnOnce(&Connection) -> DatabaseResult<T>,
) -> DatabaseResult<Option<T>> {
    let result = (|| {
        let sp = tx.savepoint()?;
        let value = f(&sp)?;
        sp.commit()?;
        Ok::<_, DatabaseError>(value)
    })();

    match result {
        Ok(value) => {
            outcome.succeeded += 1;
            Ok(Some(value))
        }
        Err(e) if tx.is_autocommit() => Err(DatabaseError::InvalidData(format!(
            "Chunk transaction aborted at {}: {}",
            id, e
        ))),
        Err(e) => {
            outcome.failures.push(BatchItemFailure {
                id: id.to_string(),
                reason: e.to_string(),
            });
            Ok(None)
        }
    }
}

fn refresh_chats(conn: &Connection, chat_ids: &BTreeSet<String>) -> DatabaseResult<()> {
    for chat_id in chat_ids {
        if queries::refresh_chat_summary(conn, chat_id)? {
            search::sync_chat(conn, chat_id)?;
        }
    }
    Ok(())
}

pub(crate) fn insert_chats(conn: &mut Connection, chats: &[Chat]) -> DatabaseResult<ChunkOutcome> {
    let mut tx = conn.transaction()?;
    let mut outcome = ChunkOutcome::default();

    for chat in chats {
        apply_item(&mut tx, &mut outcome, &chat.id, |c| {
            queries::insert_chat(c, chat)?;
            search::sync_chat(c, &chat.id)
        })?;
    }

    tx.commit()?;
    Ok(outcome)
}

pub(crate) fn insert_messages(
    conn: &mut Connection,
    messages: &[MessageRecord],
) -> DatabaseResult<ChunkOutcome> {
    let mut tx = conn.transaction()?;
    let mut outcome = ChunkOutcome::default();
    let mut touched = BTreeSet::new();

    for message in messages {
        let applied = apply_item(&mut tx, &mut outcome, &message.id, |c| {
            if !queries::chat_exists(c, &message.chat_id)? {
                return Err(DatabaseError::NotFound(format!("chat {}", message.chat_id)));
            }
            queries::insert_message(c, message)?;
            search::index_new_message(c, &message.id)
        })?;
        if applied.is_some() {
            touched.insert(message.chat_id.clone());
        }
    }

    refresh_chats(&tx, &touched)?;
    tx.commit()?;
    Ok(outcome)
}

pub(crate) fn delete_messages(conn: &mut Connection, ids: &[String]) -> DatabaseResult<ChunkOutcome> {
    let mut tx = conn.transaction()?;
    let mut outcome = ChunkOutcome::default();
    let mut touched = BTreeSet::new();

    for id in ids {
        let chat_id = apply_item(&mut tx, &mut outcome, id, |c| {
            queries::delete_message(c, id)?
                .ok_or_else(|| DatabaseError::NotFound(format!("message {}", id)))
        })?;
        if let Some(chat_id) = chat_id {
            touched.insert(chat_id);
        }
    }

    refresh_chats(&tx, &touched)?;
    tx.commit()?;
    Ok(outcome)
}

pub(crate) fn delete_chats(conn: &mut Connection, ids: &[String]) -> DatabaseResult<ChunkOutcome> {
    let mut tx = conn.transaction()?;
    let mut outcome = ChunkOutcome::default();

    for id in ids {
        apply_item(&mut tx, &mut outcome, id, |c| {
            if queries::delete_chat(c, id)? {
                Ok(())
            } else {
                Err(DatabaseError::NotFound(format!("chat {}", id)))
            }
        })?;
    }

    tx.commit()?;
    Ok(outcome)
}
