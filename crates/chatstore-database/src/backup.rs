//! Timestamped full-database backups.
//!
//! Backups are written with `VACUUM INTO`, which produces a compact,
//! self-consistent copy from inside a live connection. File names embed a
//! fixed-width UTC timestamp so lexical order is creation order:
//! `<stem>-20250101T120000.000000Z-v2.backup`.

use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{backup::Backup, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";
const BACKUP_EXTENSION: &str = "backup";

/// A backup file found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Schema version of the store when the backup was taken.
    pub schema_version: i64,
    pub size_bytes: u64,
}

/// Creates, lists and prunes backups for one store.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    stem: String,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>, max_backups: usize) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            max_backups,
        }
    }

    /// Manager for the store at `database_path`, named after its file stem.
    pub fn for_database(database_path: &Path, dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        let stem = database_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        Self::new(dir, stem, max_backups)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    /// Snapshot the database behind `conn`. Must not run inside a transaction.
    pub fn create_backup(&self, conn: &Connection, schema_version: i64) -> DatabaseResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let file_name = format!(
            "{}-{}-v{}.{}",
            self.stem,
            Utc::now().format(TIMESTAMP_FORMAT),
            schema_version,
            BACKUP_EXTENSION
        );
        let path = self.dir.join(file_name);

        conn.execute("VACUUM INTO ?1", [path.to_string_lossy().as_ref()])?;
        restrict_permissions(&path)?;

        info!(path = %path.display(), schema_version, "Backup created");
        Ok(path)
    }

    /// Backups for this store, newest first.
    pub fn list_backups(&self) -> DatabaseResult<Vec<BackupInfo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((created_at, schema_version)) = self.parse_file_name(name) else {
                continue;
            };

            backups.push(BackupInfo {
                size_bytes: entry.metadata()?.len(),
                path,
                created_at,
                schema_version,
            });
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.path.cmp(&a.path)));
        Ok(backups)
    }

    /// Delete all but the newest `max_backups`. Returns the number removed.
    pub fn prune(&self) -> DatabaseResult<usize> {
        let backups = self.list_backups()?;
        let mut removed = 0;

        for backup in backups.iter().skip(self.max_backups) {
            match std::fs::remove_file(&backup.path) {
                Ok(()) => {
                    debug!(path = %backup.path.display(), "Pruned backup");
                    removed += 1;
                }
                Err(e) => warn!(path = %backup.path.display(), error = %e, "Failed to prune backup"),
            }
        }

        Ok(removed)
    }

    /// Copy `backup` over the database behind `dest` using SQLite's online
    /// backup API.
    pub fn restore_into(backup: &Path, dest: &mut Connection) -> DatabaseResult<()> {
        if !backup.exists() {
            return Err(DatabaseError::BackupNotFound(backup.to_path_buf()));
        }

        let source = Connection::open_with_flags(backup, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Backup::new(&source, dest)?.run_to_completion(256, Duration::ZERO, None)?;

        info!(path = %backup.display(), "Backup restored");
        Ok(())
    }

    fn parse_file_name(&self, name: &str) -> Option<(DateTime<Utc>, i64)> {
        let rest = name
            .strip_prefix(self.stem.as_str())?
            .strip_prefix('-')?
            .strip_suffix(BACKUP_EXTENSION)?
            .strip_suffix('.')?;
        let (timestamp, version) = rest.rsplit_once("-v")?;

        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        Some((created_at, version.parse().ok()?))
    }
}

/// Owner read/write only.
#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
