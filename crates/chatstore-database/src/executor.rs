//! Async SQLite writer with a dedicated background thread.
//!
//! Every mutation of the store funnels through one `AsyncDatabase`:
//! - A single dedicated thread owns the write connection
//! - Calls are queued over a channel and run in FIFO order
//! - Callers park on the result instead of blocking a runtime thread
//!
//! Only SQL runs inside `call()`. Sealing/opening attachments, keychain
//! access and other slow work happen before or after the call so they never
//! hold the writer.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let chat = db.call(move |conn| queries::get_chat(conn, &id)).await?;
//! ```

use crate::{DatabaseError, DatabaseResult};
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Pragmas applied to the write connection.
const WRITER_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            DatabaseError::Connection("Writer connection closed".to_string())
        }
        tokio_rusqlite::Error::Close((_, e)) => {
            DatabaseError::Connection(format!("Failed to close writer: {}", e))
        }
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// The single writer for a store file.
///
/// Cloning is cheap; all clones share the same executor thread.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: PathBuf,
}

impl AsyncDatabase {
    /// Open (creating if needed) the database file and start the executor
    /// thread. Schema setup is left to the caller.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Opening writer connection");

        let conn = Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(WRITER_PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        debug!(path = %path.display(), "Writer ready in WAL mode");

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Run `f` on the writer thread and await its result.
    ///
    /// The closure gets `&mut Connection` so it can open transactions and
    /// savepoints. Keep it to SQL and light row mapping.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The executor only knows tokio_rusqlite errors, so our result rides
        // inside its Ok variant and is unwrapped here.
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Run a closure that only produces rusqlite errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Get the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the writer is responsive.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Writer health check passed");
        Ok(())
    }

    /// Close the connection after queued calls finish.
    pub async fn close(self) -> DatabaseResult<()> {
        info!(path = %self.path.display(), "Closing writer connection");
        self.conn.close().await.map_err(from_tokio_rusqlite)
    }
}
