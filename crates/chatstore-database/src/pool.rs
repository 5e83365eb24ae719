//! Read-only connection pool.
//!
//! Readers never block the writer: each pooled connection is `query_only`
//! and every read runs inside its own transaction, so a call sees one
//! consistent WAL snapshot even when it issues several statements.

use crate::{DatabaseError, DatabaseResult};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Configuration for the reader pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections in the pool.
    pub max_size: u32,
    /// Connection acquisition timeout.
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone)]
pub struct PoolState {
    /// Total connections (active + idle).
    pub connections: u32,
    /// Currently idle connections.
    pub idle_connections: u32,
}

/// Snapshot readers for an existing store file.
#[derive(Clone)]
pub struct ReadPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReadPool {
    /// Open readers against `path`. The file must already exist and have
    /// its schema in place.
    pub fn open(path: &Path, config: PoolConfig) -> DatabaseResult<Self> {
        if !path.exists() {
            return Err(DatabaseError::DatabaseNotFound(path.to_path_buf()));
        }

        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA query_only = ON;
                    PRAGMA cache_size = -16000;
                    PRAGMA temp_store = MEMORY;
                    PRAGMA busy_timeout = 5000;
                    ",
                )
            });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(1))
            .connection_timeout(config.connection_timeout)
            .build(manager)?;

        info!(
            path = %path.display(),
            max_size = config.max_size,
            "Reader pool created"
        );

        Ok(Self { pool })
    }

    /// Run `f` on a pooled reader inside a read transaction.
    ///
    /// Executes on the blocking thread pool so the async runtime stays free.
    pub async fn read<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> DatabaseResult<T> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await?
    }

    /// Get pool statistics for monitoring.
    pub fn state(&self) -> PoolState {
        let state = self.pool.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn seed(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO items (name) VALUES ('a'), ('b');",
        )
        .unwrap();
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let err = ReadPool::open(&path, PoolConfig::default()).err().unwrap();
        assert!(matches!(err, DatabaseError::DatabaseNotFound(p) if p == path));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reads_see_committed_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("read.db");
        seed(&path);

        let pool = ReadPool::open(&path, PoolConfig::default()).unwrap();
        let count: i64 = pool
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(pool.state().connections >= 1);
    }

    #[tokio::test]
    async fn test_readers_cannot_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        seed(&path);

        let pool = ReadPool::open(&path, PoolConfig::default()).unwrap();
        let result = pool
            .read(|conn| Ok(conn.execute("INSERT INTO items (name) VALUES ('c')", [])?))
            .await;
        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
    }
}
