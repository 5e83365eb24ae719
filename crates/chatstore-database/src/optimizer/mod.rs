//! Bulk and maintenance work: pagination, batching, archival, orphan
//! cleanup, metrics and storage optimization.
//!
//! Reads go through the [`ReadPool`]; every mutation is a closure on the
//! single writer.

mod archive;
mod batch;
mod cleanup;
mod metrics;
mod pagination;

pub use archive::{compress_text, ArchiveOptions, ArchiveReport, COMPRESSED_MAX_CHARS};
pub use batch::{BatchItemFailure, BatchResult};
pub use cleanup::CleanupReport;
pub use metrics::{
    LatencyTracker, OptimizeReport, PerformanceMetrics, QueryKind, LATENCY_WINDOW,
};
pub use pagination::{
    paginate_chats, paginate_messages, ChatFilter, MessageFilter, PaginatedResult,
    PaginationParams, SortOrder, DEFAULT_PAGE_SIZE,
};

use crate::executor::AsyncDatabase;
use crate::pool::ReadPool;
use crate::{models, search, Chat, DatabaseResult, MessageRecord};
use batch::ChunkOutcome;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs bulk operations against a store.
#[derive(Clone)]
pub struct PerformanceOptimizer {
    db: AsyncDatabase,
    readers: ReadPool,
    batch_size: usize,
    slow_query_threshold: Duration,
    latencies: Arc<LatencyTracker>,
}

impl PerformanceOptimizer {
    pub fn new(
        db: AsyncDatabase,
        readers: ReadPool,
        batch_size: usize,
        slow_query_threshold: Duration,
    ) -> Self {
        Self {
            db,
            readers,
            batch_size: batch_size.max(1),
            slow_query_threshold,
            latencies: Arc::new(LatencyTracker::new()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn latencies(&self) -> &LatencyTracker {
        &self.latencies
    }

    fn observe(&self, kind: QueryKind, elapsed: Duration) {
        self.latencies.record(kind, elapsed);
        if elapsed > self.slow_query_threshold {
            warn!(
                kind = ?kind,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_query_threshold.as_millis() as u64,
                "Slow paginated query"
            );
        }
    }

    // ==========================================
    // Pagination
    // ==========================================

    pub async fn paginate_chats(
        &self,
        params: PaginationParams,
        filter: ChatFilter,
    ) -> DatabaseResult<PaginatedResult<Chat>> {
        let started = Instant::now();
        let page = self
            .readers
            .read(move |conn| paginate_chats(conn, &params, &filter))
            .await?;
        self.observe(QueryKind::Chats, started.elapsed());
        Ok(page)
    }

    pub async fn paginate_messages(
        &self,
        params: PaginationParams,
        filter: MessageFilter,
    ) -> DatabaseResult<PaginatedResult<MessageRecord>> {
        let started = Instant::now();
        let page = self
            .readers
            .read(move |conn| paginate_messages(conn, &params, &filter))
            .await?;
        self.observe(QueryKind::Messages, started.elapsed());
        Ok(page)
    }

    // ==========================================
    // Batch mutation
    // ==========================================

    /// Apply `items` in chunks of `batch_size`. A chunk whose transaction
    /// fails counts all of its items as failed; the next chunk still runs.
    async fn run_batch<I>(
        &self,
        operation: &'static str,
        items: Vec<I>,
        id_of: fn(&I) -> String,
        apply: fn(&mut Connection, &[I]) -> DatabaseResult<ChunkOutcome>,
    ) -> BatchResult
    where
        I: Clone + Send + 'static,
    {
        let started = Instant::now();
        let mut result = BatchResult::default();

        for chunk in items.chunks(self.batch_size) {
            let owned = chunk.to_vec();
            match self.db.call(move |conn| apply(conn, &owned)).await {
                Ok(outcome) => result.absorb(outcome),
                Err(e) => {
                    warn!(operation, chunk_len = chunk.len(), error = %e, "Batch chunk failed");
                    for item in chunk {
                        result.fail(id_of(item), e.to_string());
                    }
                }
            }
        }

        result.elapsed = started.elapsed();
        info!(
            operation,
            succeeded = result.success_count,
            failed = result.failure_count,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Batch finished"
        );
        result
    }

    pub async fn batch_insert_chats(&self, chats: Vec<Chat>) -> BatchResult {
        self.run_batch("insert_chats", chats, |c: &Chat| c.id.clone(), batch::insert_chats)
            .await
    }

    /// Insert sealed messages. Items naming a missing chat fail individually.
    pub async fn batch_insert_messages(&self, messages: Vec<MessageRecord>) -> BatchResult {
        self.run_batch(
            "insert_messages",
            messages,
            |m: &MessageRecord| m.id.clone(),
            batch::insert_messages,
        )
        .await
    }

    pub async fn batch_delete_messages(&self, ids: Vec<String>) -> BatchResult {
        self.run_batch("delete_messages", ids, |id: &String| id.clone(), batch::delete_messages)
            .await
    }

    pub async fn batch_delete_chats(&self, ids: Vec<String>) -> BatchResult {
        self.run_batch("delete_chats", ids, |id: &String| id.clone(), batch::delete_chats)
            .await
    }

    // ==========================================
    // Archival and cleanup
    // ==========================================

    /// Archive chats idle for longer than `options.older_than_days`.
    ///
    /// Each chat is archived in its own transaction; a failure stops the run
    /// and leaves already archived chats in place.
    pub async fn archive_old_chats(&self, options: ArchiveOptions) -> DatabaseResult<ArchiveReport> {
        let started = Instant::now();
        let now = models::now();
        let cutoff = options.cutoff(now)?;

        let candidates = self
            .readers
            .read(move |conn| archive::find_candidates(conn, &cutoff))
            .await?;

        debug!(candidates = candidates.len(), %cutoff, "Archiving stale chats");

        let mut report = ArchiveReport::default();
        for chat_id in candidates {
            let options = options.clone();
            let id = chat_id.clone();
            let outcome = self
                .db
                .call(move |conn| archive::archive_chat(conn, &id, &cutoff, &options, &now))
                .await?;

            if let Some(outcome) = outcome {
                report.archived_chats += 1;
                report.trimmed_messages += outcome.trimmed;
                report.freed_bytes += outcome.freed_bytes;
                report.archived_chat_ids.push(chat_id);
            }
        }

        report.elapsed = started.elapsed();
        info!(
            archived = report.archived_chats,
            trimmed = report.trimmed_messages,
            freed_bytes = report.freed_bytes,
            "Archival finished"
        );
        Ok(report)
    }

    /// Delete messages whose chat is gone, then drop dangling search entries.
    pub async fn cleanup_orphaned_data(&self) -> DatabaseResult<CleanupReport> {
        let started = Instant::now();
        let mut report = CleanupReport::default();
        let limit = self.batch_size;

        loop {
            let (deleted, freed) = self
                .db
                .call(move |conn| cleanup::delete_orphan_chunk(conn, limit))
                .await?;
            if deleted == 0 {
                break;
            }
            report.deleted_records += deleted;
            report.freed_bytes += freed;
        }

        report.purged_search_entries = self.db.call(|conn| search::purge_orphans(conn)).await?;
        report.elapsed = started.elapsed();

        info!(
            deleted = report.deleted_records,
            freed_bytes = report.freed_bytes,
            purged_search_entries = report.purged_search_entries,
            "Orphan cleanup finished"
        );
        Ok(report)
    }

    /// Orphaned messages currently in the store.
    pub async fn orphan_count(&self) -> DatabaseResult<usize> {
        self.readers.read(|conn| cleanup::count_orphans(conn)).await
    }

    // ==========================================
    // Metrics and optimization
    // ==========================================

    /// Current storage statistics. Latency averages come from recent
    /// paginated queries; a kind with no samples is probed once.
    pub async fn metrics(&self) -> DatabaseResult<PerformanceMetrics> {
        let mut metrics = self.readers.read(|conn| metrics::storage_metrics(conn)).await?;

        if self.latencies.sample_count(QueryKind::Chats) == 0 {
            self.paginate_chats(PaginationParams::new(0, 1), ChatFilter::default())
                .await?;
        }
        if self.latencies.sample_count(QueryKind::Messages) == 0 {
            self.paginate_messages(PaginationParams::new(0, 1), MessageFilter::default())
                .await?;
        }

        metrics.avg_chat_query_ms = self.latencies.average_ms(QueryKind::Chats).unwrap_or_default();
        metrics.avg_message_query_ms = self
            .latencies
            .average_ms(QueryKind::Messages)
            .unwrap_or_default();
        Ok(metrics)
    }

    /// Compact the file and refresh statistics.
    pub async fn optimize(&self) -> DatabaseResult<OptimizeReport> {
        let started = Instant::now();
        let (before, after) = self
            .db
            .call(|conn| {
                let before = metrics::page_stats(conn)?;
                metrics::optimize_storage(conn)?;
                let after = metrics::page_stats(conn)?;
                Ok((before, after))
            })
            .await?;

        let report = OptimizeReport {
            size_before_bytes: before.size_bytes,
            size_after_bytes: after.size_bytes,
            fragmentation_before: before.fragmentation,
            fragmentation_after: after.fragmentation,
            elapsed: started.elapsed(),
        };
        info!(
            size_before = report.size_before_bytes,
            size_after = report.size_after_bytes,
            "Storage optimized"
        );
        Ok(report)
    }
}
