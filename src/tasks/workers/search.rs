//! Search index maintenance.
//!
//! The engine does not ship a search backend. It keeps whatever
//! [`SearchIndex`] it is given in step with the comic table; the default
//! [`LoggingIndex`] only counts and logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::status::{StatusKind, StatusTracker};
use crate::tasks::{SearchTask, Worker};

/// A search backend fed by the sync engine.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// (Re)index comics that were inserted, updated or moved.
    async fn update(&self, pool: &SqlitePool, comic_ids: &[i64]) -> Result<()>;

    /// Drop deleted comics from the index.
    async fn remove(&self, comic_ids: &[i64]) -> Result<()>;
}

/// Index that records what it was asked to do.
#[derive(Debug, Default)]
pub struct LoggingIndex {
    updated: AtomicU64,
    removed: AtomicU64,
}

impl LoggingIndex {
    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SearchIndex for LoggingIndex {
    async fn update(&self, _pool: &SqlitePool, comic_ids: &[i64]) -> Result<()> {
        self.updated.fetch_add(comic_ids.len() as u64, Ordering::Relaxed);
        tracing::info!(target: "tasks::search", count = comic_ids.len(), "Search entries updated");
        Ok(())
    }

    async fn remove(&self, comic_ids: &[i64]) -> Result<()> {
        self.removed.fetch_add(comic_ids.len() as u64, Ordering::Relaxed);
        tracing::info!(target: "tasks::search", count = comic_ids.len(), "Search entries removed");
        Ok(())
    }
}

/// Forwards search tasks to an index.
pub struct SearchWorker {
    pool: SqlitePool,
    index: Arc<dyn SearchIndex>,
}

impl SearchWorker {
    pub fn new(pool: SqlitePool, index: Arc<dyn SearchIndex>) -> Self {
        Self { pool, index }
    }
}

#[async_trait]
impl Worker for SearchWorker {
    type Task = SearchTask;
    const NAME: &'static str = "search";

    async fn handle(&mut self, task: SearchTask) {
        let (ids, result) = match &task {
            SearchTask::Update { comic_ids } => {
                let mut tracker = StatusTracker::start(&self.pool, StatusKind::Search, Some(comic_ids.len() as u64)).await;
                let result = self.index.update(&self.pool, comic_ids).await;
                if result.is_ok() {
                    tracker.advance(comic_ids.len() as u64).await;
                }
                tracker.finish().await;
                (comic_ids.len(), result)
            }
            SearchTask::Remove { comic_ids } => (comic_ids.len(), self.index.remove(comic_ids).await),
        };
        if let Err(e) = result {
            tracing::error!(target: "tasks::search", count = ids, error = %e, "Search index update failed");
        }
    }
}
