//! Cover cache maintenance.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::cover::CoverCache;
use crate::metadata::MetadataDecoder;
use crate::status::{StatusKind, StatusTracker};
use crate::tasks::{CoverTask, Notification, Task, TaskSender, Worker};

/// Extracts, stores and purges cached covers.
pub struct CoverWorker {
    pool: SqlitePool,
    cache: Arc<CoverCache>,
    decoder: Arc<dyn MetadataDecoder>,
    tasks: TaskSender,
}

impl CoverWorker {
    pub fn new(
        pool: SqlitePool,
        cache: CoverCache,
        decoder: Arc<dyn MetadataDecoder>,
        tasks: TaskSender,
    ) -> Self {
        Self {
            pool,
            cache: Arc::new(cache),
            decoder,
            tasks,
        }
    }

    /// Extract covers for `items`, skipping cached ones unless forced.
    ///
    /// Returns how many covers were written.
    async fn create(&self, items: Vec<(PathBuf, bool)>) -> u64 {
        let todo: Vec<PathBuf> = items
            .into_iter()
            .filter(|(path, force)| *force || !self.cache.contains(path))
            .map(|(path, _)| path)
            .collect();
        if todo.is_empty() {
            return 0;
        }

        let mut tracker = StatusTracker::start(&self.pool, StatusKind::Covers, Some(todo.len() as u64)).await;
        let mut written = 0;
        for path in todo {
            let cache = Arc::clone(&self.cache);
            let decoder = Arc::clone(&self.decoder);
            let result = tokio::task::spawn_blocking(move || -> Result<bool, String> {
                match decoder.cover(&path).map_err(|e| e.to_string())? {
                    Some(bytes) => {
                        cache.put(&path, &bytes).map_err(|e| e.to_string())?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await;
            match result {
                Ok(Ok(true)) => written += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => tracing::debug!(target: "tasks::cover", error = %e, "Cover extraction failed"),
                Err(e) => tracing::error!(target: "tasks::cover", error = %e, "Cover task panicked"),
            }
            tracker.advance(1).await;
        }
        tracker.finish().await;
        written
    }

    fn purge(&self, paths: &[PathBuf]) -> u64 {
        let mut removed = 0;
        for path in paths {
            match self.cache.remove(path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(target: "tasks::cover", path = %path.display(), error = %e, "Failed to remove cover");
                }
            }
        }
        removed
    }
}

#[async_trait]
impl Worker for CoverWorker {
    type Task = CoverTask;
    const NAME: &'static str = "cover";

    async fn handle(&mut self, task: CoverTask) {
        match task {
            CoverTask::Store { path, bytes } => {
                if let Err(e) = self.cache.put(&path, &bytes) {
                    tracing::warn!(target: "tasks::cover", path = %path.display(), error = %e, "Failed to store cover");
                }
            }
            CoverTask::Create { items } => {
                let requested = items.len();
                let written = self.create(items).await;
                tracing::debug!(target: "tasks::cover", requested, written, "Covers created");
                if written > 0 && !self.tasks.send(Task::Notify(Notification::StatusChanged(StatusKind::Covers))) {
                    tracing::warn!(target: "tasks::cover", "Dispatcher is gone, dropping cover notification");
                }
            }
            CoverTask::Purge { paths } => {
                let removed = self.purge(&paths);
                tracing::debug!(target: "tasks::cover", requested = paths.len(), removed, "Covers purged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ComicMetadata, DecodeError};
    use crate::tasks::Envelope;
    use crate::test_utils::temp_db;
    use std::path::Path;

    struct PngDecoder;

    impl MetadataDecoder for PngDecoder {
        fn decode(&self, _path: &Path) -> Result<ComicMetadata, DecodeError> {
            Ok(ComicMetadata::default())
        }

        fn cover(&self, path: &Path) -> Result<Option<Vec<u8>>, DecodeError> {
            let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
            bytes.extend_from_slice(path.to_string_lossy().as_bytes());
            Ok(Some(bytes))
        }
    }

    async fn worker() -> (CoverWorker, Arc<CoverCache>, SqlitePool, tempfile::TempDir, tempfile::TempDir) {
        let (pool, db_dir) = temp_db().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let (tasks, _rx) = TaskSender::channel();
        let worker = CoverWorker::new(pool.clone(), CoverCache::new(cache_dir.path()), Arc::new(PngDecoder), tasks);
        let cache = Arc::clone(&worker.cache);
        (worker, cache, pool, db_dir, cache_dir)
    }

    #[tokio::test]
    async fn test_create_then_purge() {
        let (mut worker, cache, _pool, _db, _dir) = worker().await;
        let path = PathBuf::from("/lib/a.cbz");

        worker
            .handle(CoverTask::Create {
                items: vec![(path.clone(), false)],
            })
            .await;
        assert!(cache.contains(&path));

        worker.handle(CoverTask::Purge { paths: vec![path.clone()] }).await;
        assert!(!cache.contains(&path));
    }

    #[tokio::test]
    async fn test_cached_cover_is_kept_unless_forced() {
        let (worker, cache, _pool, _db, _dir) = worker().await;
        let path = PathBuf::from("/lib/a.cbz");
        cache.put(&path, b"GIF89a").unwrap();

        assert_eq!(worker.create(vec![(path.clone(), false)]).await, 0);
        assert_eq!(cache.get(&path).unwrap(), b"GIF89a");

        assert_eq!(worker.create(vec![(path.clone(), true)]).await, 1);
        assert!(cache.get(&path).unwrap().starts_with(b"\x89PNG"));
    }

    #[tokio::test]
    async fn test_store_writes_given_bytes() {
        let (mut worker, cache, _pool, _db, _dir) = worker().await;
        let path = PathBuf::from("/lib/b.cbz");
        worker
            .handle(CoverTask::Store {
                path: path.clone(),
                bytes: b"\xff\xd8\xff\xe0".to_vec(),
            })
            .await;
        assert_eq!(cache.get(&path).unwrap(), b"\xff\xd8\xff\xe0");
    }

    #[tokio::test]
    async fn test_created_covers_notify_status() {
        let (pool, _db) = temp_db().await;
        let cache_dir = tempfile::tempdir().unwrap();
        let (tasks, mut rx) = TaskSender::channel();
        let mut worker = CoverWorker::new(pool, CoverCache::new(cache_dir.path()), Arc::new(PngDecoder), tasks);

        worker
            .handle(CoverTask::Create {
                items: vec![(PathBuf::from("/lib/c.cbz"), false)],
            })
            .await;
        assert!(matches!(
            rx.try_recv(),
            Ok(Envelope::Work(Task::Notify(Notification::StatusChanged(StatusKind::Covers))))
        ));
    }
}
