//! Schema migrations.
//!
//! Version 1 is the baseline schema from [`schema::create_baseline`]. Every
//! later version has one registered [`Migration`]. Attempts are tracked in
//! `migration_records`; the current version is the highest completed one.
//!
//! A migration run takes a full backup first, then applies every pending
//! step inside one transaction. On failure the transaction rolls back, a
//! `failed` record is written, and the error carries the backup path.
//! Nothing is restored automatically.

use crate::backup::BackupManager;
use crate::queries::{format_timestamp, read_timestamp};
use crate::schema::{self, CURRENT_SCHEMA_VERSION};
use crate::{models, DatabaseError, DatabaseResult, MigrationRecord, MigrationStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Description recorded for the baseline.
pub const BASELINE_DESCRIPTION: &str = "Initial schema creation";

/// One schema step.
#[derive(Clone, Copy)]
pub struct Migration {
    pub from_version: i64,
    pub to_version: i64,
    pub description: &'static str,
    pub apply: fn(&Connection) -> DatabaseResult<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .finish()
    }
}

/// Every migration after the baseline, in order.
pub fn registry() -> Vec<Migration> {
    vec![
        Migration {
            from_version: 1,
            to_version: 2,
            description: "Add key rotation history",
            apply: migrate_v2_key_rotation_history,
        },
        Migration {
            from_version: 2,
            to_version: 3,
            description: "Track chat archival time",
            apply: migrate_v3_chat_archived_at,
        },
    ]
}

/// V2: audit trail for key rotations.
fn migrate_v2_key_rotation_history(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS key_rotation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            previous_key_hash TEXT NOT NULL,
            new_key_hash TEXT NOT NULL,
            rotated_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// V3: remember when archival marked a chat.
fn migrate_v3_chat_archived_at(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE chats ADD COLUMN archived_at TEXT;
        CREATE INDEX IF NOT EXISTS idx_chats_archived_at ON chats(archived_at);
        ",
    )?;
    Ok(())
}

/// What a call to [`MigrationEngine::migrate_if_needed`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// The store was already at the target version.
    UpToDate { version: i64 },
    Migrated {
        from_version: i64,
        to_version: i64,
        backup_path: PathBuf,
    },
}

/// Brings a store from its recorded version to a target version.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    migrations: Vec<Migration>,
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new(registry())
    }
}

impl MigrationEngine {
    pub fn new(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    /// Highest version this engine can reach with an unbroken chain.
    pub fn latest_version(&self) -> i64 {
        let mut version = 1;
        while let Some(m) = self.find(version + 1) {
            version = m.to_version;
        }
        version
    }

    fn find(&self, to_version: i64) -> Option<&Migration> {
        self.migrations
            .iter()
            .find(|m| m.to_version == to_version && m.from_version == to_version - 1)
    }

    /// Migrate the store behind `conn` to `target`.
    pub fn migrate_if_needed(
        &self,
        conn: &mut Connection,
        target: i64,
        backups: &BackupManager,
    ) -> DatabaseResult<MigrationOutcome> {
        ensure_record_table(conn)?;
        let current = current_version(conn)?;

        info!(current_version = current, target_version = target, "Checking schema version");

        if current == target {
            return Ok(MigrationOutcome::UpToDate { version: current });
        }
        if current > target {
            return Err(DatabaseError::InvalidSchemaVersion { current, target });
        }

        // Resolve the full chain before touching anything.
        let first_step = if current == 0 { 2 } else { current + 1 };
        let steps = (first_step..=target)
            .map(|v| self.find(v).copied().ok_or(DatabaseError::MigrationChainGap(v)))
            .collect::<DatabaseResult<Vec<_>>>()?;

        let backup_path = backups.create_backup(conn, current)?;

        let mut attempting = if current == 0 { 1 } else { first_step };
        let result = (|| -> DatabaseResult<()> {
            let tx = conn.transaction()?;

            if current == 0 {
                schema::create_baseline(&tx)?;
                record(&tx, 1, BASELINE_DESCRIPTION, MigrationStatus::Completed, None)?;
                debug!("Applied baseline schema");
            }

            for step in &steps {
                attempting = step.to_version;
                info!(version = step.to_version, description = step.description, "Applying migration");
                (step.apply)(&tx)?;
                record(&tx, step.to_version, step.description, MigrationStatus::Completed, None)?;
            }

            tx.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                info!(from_version = current, to_version = target, "Migrations complete");
                Ok(MigrationOutcome::Migrated {
                    from_version: current,
                    to_version: target,
                    backup_path,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                error!(version = attempting, error = %reason, backup = %backup_path.display(), "Migration failed");

                // The transaction is gone; this record lands on its own.
                let description = self
                    .find(attempting)
                    .map(|m| m.description)
                    .unwrap_or(BASELINE_DESCRIPTION);
                if let Err(record_err) =
                    record(conn, attempting, description, MigrationStatus::Failed, Some(&reason))
                {
                    error!(error = %record_err, "Failed to record migration failure");
                }

                Err(DatabaseError::MigrationFailed {
                    reason,
                    backup_path,
                })
            }
        }
    }

    /// Migrate to [`CURRENT_SCHEMA_VERSION`].
    pub fn migrate_to_current(
        &self,
        conn: &mut Connection,
        backups: &BackupManager,
    ) -> DatabaseResult<MigrationOutcome> {
        self.migrate_if_needed(conn, CURRENT_SCHEMA_VERSION, backups)
    }
}

fn ensure_record_table(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS migration_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
            error_message TEXT
        );
        ",
    )?;
    Ok(())
}

fn record(
    conn: &Connection,
    version: i64,
    description: &str,
    status: MigrationStatus,
    error_message: Option<&str>,
) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migration_records (version, description, applied_at, status, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            version,
            description,
            format_timestamp(&models::now()),
            status.as_str(),
            error_message
        ],
    )?;
    debug!(version, description, status = status.as_str(), "Migration recorded");
    Ok(())
}

/// Highest completed version, 0 for a store with no schema yet.
pub fn current_version(conn: &Connection) -> DatabaseResult<i64> {
    if !schema::table_exists(conn, "migration_records")? {
        return Ok(0);
    }

    let version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM migration_records WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Every migration attempt, oldest first.
pub fn history(conn: &Connection) -> DatabaseResult<Vec<MigrationRecord>> {
    if !schema::table_exists(conn, "migration_records")? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare_cached(
        "SELECT version, description, applied_at, status, error_message
         FROM migration_records ORDER BY id",
    )?;

    let rows = stmt.query_map([], |row| {
        let status: String = row.get(3)?;
        Ok(MigrationRecord {
            version: row.get(0)?,
            description: row.get(1)?,
            applied_at: read_timestamp(row, 2)?,
            status: status.parse().map_err(|e: DatabaseError| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
            })?,
            error_message: row.get(4)?,
        })
    })?;

    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}
