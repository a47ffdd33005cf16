//! Owner of the file watcher and the poller.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db;
use crate::scanner::FileWatcher;
use crate::scanner::PollerHandle;
use crate::tasks::{WatchTask, Worker};

/// Keeps watched roots and poll schedules in step with the library table.
pub struct WatchManager {
    pool: SqlitePool,
    watcher: Option<FileWatcher>,
    poller: Option<PollerHandle>,
    shutdown_timeout: Duration,
}

impl WatchManager {
    /// `watcher` is None when OS events are unavailable; libraries are
    /// then only polled.
    pub fn new(
        pool: SqlitePool,
        watcher: Option<FileWatcher>,
        poller: PollerHandle,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            watcher,
            poller: Some(poller),
            shutdown_timeout,
        }
    }

    /// Ids of libraries with a live watch.
    pub fn watched(&self) -> Vec<i64> {
        let mut ids = self.watcher.as_ref().map(FileWatcher::watched).unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    async fn reload(&mut self) {
        let libraries = match db::get_libraries(&self.pool).await {
            Ok(libraries) => libraries,
            Err(e) => {
                tracing::error!(target: "tasks::watch", error = %e, "Failed to load libraries");
                return;
            }
        };

        if let Some(watcher) = self.watcher.as_mut() {
            let wanted: HashSet<i64> = libraries.iter().filter(|l| l.events).map(|l| l.id).collect();
            for id in watcher.watched() {
                if !wanted.contains(&id)
                    && let Err(e) = watcher.unwatch_library(id)
                {
                    tracing::warn!(target: "tasks::watch", library = id, error = %e, "Failed to unwatch library");
                }
            }
            let watched: HashSet<i64> = watcher.watched().into_iter().collect();
            for library in libraries.iter().filter(|l| l.events && !watched.contains(&l.id)) {
                if let Err(e) = watcher.watch_library(library.id, Path::new(&library.path)) {
                    tracing::warn!(target: "tasks::watch", library = library.id, error = %e, "Cannot watch library, retrying on next reload");
                }
            }
        }

        if let Some(poller) = &self.poller
            && !poller.reload()
        {
            tracing::error!(target: "tasks::watch", "Poller is gone");
        }
        tracing::info!(target: "tasks::watch", libraries = libraries.len(), watched = self.watched().len(), "Watches reloaded");
    }
}

#[async_trait]
impl Worker for WatchManager {
    type Task = WatchTask;
    const NAME: &'static str = "watch";

    async fn handle(&mut self, task: WatchTask) {
        match task {
            WatchTask::Reload => self.reload().await,
            WatchTask::Poll(poll) => {
                let Some(poller) = &self.poller else {
                    return;
                };
                if !poller.poll_now(poll.library_ids, poll.force) {
                    tracing::error!(target: "tasks::watch", "Poller is gone, dropping poll request");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.watcher = None;
        if let Some(poller) = self.poller.take() {
            poller.shutdown(self.shutdown_timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::BatcherMessage;
    use crate::config::SyncConfig;
    use crate::scanner::spawn_poller;
    use crate::test_utils::{temp_db, temp_library};

    #[tokio::test]
    async fn test_reload_follows_event_flag() {
        let (pool, _dir) = temp_db().await;
        let (watched_id, _watched_root) = temp_library(&pool).await;
        let (polled_id, _polled_root) = temp_library(&pool).await;
        db::update_library_settings(&pool, polled_id, false, true, 3600).await.unwrap();

        let (tx, _rx) = crossbeam_channel::unbounded::<BatcherMessage>();
        let watcher = FileWatcher::new(Duration::from_millis(50), tx.clone()).unwrap();
        let poller = spawn_poller(pool.clone(), SyncConfig::default(), tx);
        let mut manager = WatchManager::new(pool.clone(), Some(watcher), poller, Duration::from_secs(1));

        manager.handle(WatchTask::Reload).await;
        assert_eq!(manager.watched(), vec![watched_id]);

        db::update_library_settings(&pool, watched_id, false, true, 3600).await.unwrap();
        manager.handle(WatchTask::Reload).await;
        assert!(manager.watched().is_empty());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_library_is_unwatched() {
        let (pool, _dir) = temp_db().await;
        let (id, _root) = temp_library(&pool).await;

        let (tx, _rx) = crossbeam_channel::unbounded::<BatcherMessage>();
        let watcher = FileWatcher::new(Duration::from_millis(50), tx.clone()).unwrap();
        let poller = spawn_poller(pool.clone(), SyncConfig::default(), tx);
        let mut manager = WatchManager::new(pool.clone(), Some(watcher), poller, Duration::from_secs(1));

        manager.handle(WatchTask::Reload).await;
        assert_eq!(manager.watched(), vec![id]);

        db::remove_library(&pool, id).await.unwrap();
        manager.handle(WatchTask::Reload).await;
        assert!(manager.watched().is_empty());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_root_does_not_block_others() {
        let (pool, _dir) = temp_db().await;
        let (gone_id, gone_root) = temp_library(&pool).await;
        let (ok_id, _ok_root) = temp_library(&pool).await;
        drop(gone_root);

        let (tx, _rx) = crossbeam_channel::unbounded::<BatcherMessage>();
        let watcher = FileWatcher::new(Duration::from_millis(50), tx.clone()).unwrap();
        let poller = spawn_poller(pool.clone(), SyncConfig::default(), tx);
        let mut manager = WatchManager::new(pool.clone(), Some(watcher), poller, Duration::from_secs(1));

        manager.handle(WatchTask::Reload).await;
        assert_eq!(manager.watched(), vec![ok_id]);
        assert!(!manager.watched().contains(&gone_id));

        manager.shutdown().await;
    }
}
