//! Storage statistics and query latency tracking.

use crate::{search, DatabaseResult};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept per query kind.
pub const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Chats,
    Messages,
}

/// Rolling window of recent paginated query latencies.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    chats: Mutex<VecDeque<Duration>>,
    messages: Mutex<VecDeque<Duration>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, kind: QueryKind) -> &Mutex<VecDeque<Duration>> {
        match kind {
            QueryKind::Chats => &self.chats,
            QueryKind::Messages => &self.messages,
        }
    }

    pub fn record(&self, kind: QueryKind, latency: Duration) {
        let mut window = self.window(kind).lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency);
    }

    pub fn sample_count(&self, kind: QueryKind) -> usize {
        self.window(kind).lock().len()
    }

    /// Mean latency in milliseconds, `None` without samples.
    pub fn average_ms(&self, kind: QueryKind) -> Option<f64> {
        let window = self.window(kind).lock();
        if window.is_empty() {
            return None;
        }
        let total: Duration = window.iter().sum();
        Some(total.as_secs_f64() * 1000.0 / window.len() as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub chat_count: usize,
    pub archived_chat_count: usize,
    pub message_count: usize,
    pub search_entry_count: usize,
    pub database_size_bytes: u64,
    /// User-defined indexes.
    pub index_count: usize,
    pub avg_chat_query_ms: f64,
    pub avg_message_query_ms: f64,
    /// Free pages over total pages, 0.0 to 1.0.
    pub fragmentation: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub size_before_bytes: u64,
    pub size_after_bytes: u64,
    pub fragmentation_before: f64,
    pub fragmentation_after: f64,
    pub elapsed: Duration,
}

/// Size in bytes and fragmentation ratio of the main database file.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PageStats {
    pub size_bytes: u64,
    pub fragmentation: f64,
}

fn pragma_i64(conn: &Connection, pragma: &str) -> DatabaseResult<i64> {
    Ok(conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get(0))?)
}

fn count(conn: &Connection, sql: &str) -> DatabaseResult<usize> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

pub(crate) fn page_stats(conn: &Connection) -> DatabaseResult<PageStats> {
    let page_count = pragma_i64(conn, "page_count")?;
    let page_size = pragma_i64(conn, "page_size")?;
    let freelist = pragma_i64(conn, "freelist_count")?;

    Ok(PageStats {
        size_bytes: (page_count.max(0) as u64) * (page_size.max(0) as u64),
        fragmentation: if page_count > 0 {
            freelist as f64 / page_count as f64
        } else {
            0.0
        },
    })
}

/// Everything in [`PerformanceMetrics`] except latencies.
pub(crate) fn storage_metrics(conn: &Connection) -> DatabaseResult<PerformanceMetrics> {
    let pages = page_stats(conn)?;

    Ok(PerformanceMetrics {
        chat_count: count(conn, "SELECT COUNT(*) FROM chats")?,
        archived_chat_count: count(conn, "SELECT COUNT(*) FROM chats WHERE is_archived = 1")?,
        message_count: count(conn, "SELECT COUNT(*) FROM messages")?,
        search_entry_count: count(
            conn,
            "SELECT (SELECT COUNT(*) FROM chats_search) + (SELECT COUNT(*) FROM messages_search)",
        )?,
        database_size_bytes: pages.size_bytes,
        index_count: count(
            conn,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
        )?,
        avg_chat_query_ms: 0.0,
        avg_message_query_ms: 0.0,
        fragmentation: pages.fragmentation,
    })
}

/// Refresh planner statistics, merge search segments, compact the file and
/// truncate the WAL.
pub(crate) fn optimize_storage(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch("PRAGMA optimize;")?;
    search::optimize(conn)?;
    conn.execute_batch("VACUUM;")?;
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(())
}
