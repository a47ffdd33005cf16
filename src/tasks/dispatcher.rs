//! The dispatcher: one queue in, one worker per concern out.
//!
//! # Architecture
//!
//! ```text
//!  FileWatcher ─┐                         ┌─► SyncWorker ──┐ (follow-up tasks)
//!               ├─► Batcher ─► TaskSender ─┤─► CoverWorker  │
//!  Poller ──────┘      ▲        (queue)   ├─► SearchWorker │
//!                      │            ▲      ├─► Notifier     │
//!                      │            └──────┼────────────────┘
//!                      └── WatchManager ◄──┘ (Reload / Poll)
//! ```
//!
//! Routing never blocks: each task is moved onto its worker's queue and
//! the dispatcher reads the next one. Shutdown is ordered so nothing
//! queued is lost: the batcher flushes its pending batches onto the
//! queue, the sentinel follows them, then the watch manager stops the
//! event sources and every other worker drains.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::workers::{CoverWorker, Notifier, SearchIndex, SearchWorker, SyncWorker, WatchManager};
use super::{
    CoverTask, Envelope, Notification, SearchTask, SyncTask, Task, TaskSender, WatchTask, WorkerHandle,
    spawn_worker,
};
use crate::batcher::{BatcherHandle, BatcherSettings, spawn_batcher};
use crate::config::Config;
use crate::cover::CoverCache;
use crate::error::{Error, Result};
use crate::importer::{ImportSettings, Importer};
use crate::metadata::MetadataDecoder;
use crate::scanner::{FileWatcher, spawn_poller};

/// Routes tasks to the worker that owns them.
pub struct Dispatcher {
    sync: WorkerHandle<SyncTask>,
    cover: WorkerHandle<CoverTask>,
    search: WorkerHandle<SearchTask>,
    notify: WorkerHandle<Notification>,
    watch: WorkerHandle<WatchTask>,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        sync: WorkerHandle<SyncTask>,
        cover: WorkerHandle<CoverTask>,
        search: WorkerHandle<SearchTask>,
        notify: WorkerHandle<Notification>,
        watch: WorkerHandle<WatchTask>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            sync,
            cover,
            search,
            notify,
            watch,
            shutdown_timeout,
        }
    }

    /// Hand `task` to its worker. Returns false if that worker is gone.
    pub fn route(&self, task: Task) -> bool {
        match task {
            Task::Sync(t) => self.sync.send(t),
            Task::Poll(t) => self.watch.send(WatchTask::Poll(t)),
            Task::Cover(t) => self.cover.send(t),
            Task::Search(t) => self.search.send(t),
            Task::Notify(t) => self.notify.send(t),
            Task::Watch(t) => self.watch.send(t),
        }
    }

    /// Route tasks until the shutdown sentinel, then stop every worker.
    pub async fn run(self, mut rx: UnboundedReceiver<Envelope<Task>>) {
        tracing::info!(target: "tasks::dispatcher", "Dispatcher started");
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Work(task) => {
                    let kind = task.kind();
                    if !self.route(task) {
                        tracing::error!(target: "tasks::dispatcher", kind, "Worker gone, task dropped");
                    }
                }
                Envelope::Shutdown => break,
            }
        }
        self.stop(rx).await;
    }

    /// Stop the workers in dependency order.
    ///
    /// The sync worker goes first since draining it produces cover,
    /// search and notification work, which is still routed here.
    async fn stop(self, mut rx: UnboundedReceiver<Envelope<Task>>) {
        let timeout = self.shutdown_timeout;
        self.watch.stop(timeout).await;
        self.sync.stop(timeout).await;

        while let Ok(envelope) = rx.try_recv() {
            let Envelope::Work(task) = envelope else {
                continue;
            };
            let routed = match task {
                Task::Cover(t) => self.cover.send(t),
                Task::Search(t) => self.search.send(t),
                Task::Notify(t) => self.notify.send(t),
                other => {
                    tracing::debug!(target: "tasks::dispatcher", kind = other.kind(), "Dropping task queued during shutdown");
                    true
                }
            };
            if !routed {
                tracing::error!(target: "tasks::dispatcher", "Worker gone during shutdown");
            }
        }

        futures::future::join3(
            self.cover.stop(timeout),
            self.search.stop(timeout),
            self.notify.stop(timeout),
        )
        .await;
        tracing::info!(target: "tasks::dispatcher", "Dispatcher stopped");
    }
}

/// Handle to the running engine: dispatcher, workers and batcher.
pub struct DispatcherHandle {
    tasks: TaskSender,
    notifications: broadcast::Sender<Notification>,
    batcher: Option<BatcherHandle>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Start every worker and the batcher, then load the libraries.
    pub fn start(
        pool: SqlitePool,
        config: &Config,
        decoder: Arc<dyn MetadataDecoder>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        let sync_config = &config.sync;
        sync_config.validate().map_err(Error::config)?;
        let timeout = sync_config.shutdown_timeout();
        let (tasks, rx) = TaskSender::channel();

        let batcher = spawn_batcher(BatcherSettings::from(sync_config), tasks.clone())?;
        let watcher = match FileWatcher::new(sync_config.debounce(), batcher.sender()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(target: "tasks::dispatcher", error = %e, "OS events unavailable, polling only");
                None
            }
        };
        let poller = spawn_poller(pool.clone(), sync_config.clone(), batcher.sender());
        if let Some(watcher) = &watcher {
            watcher.report_unreachable_to(poller.commands());
        }

        let importer = Importer::new(pool.clone(), Arc::clone(&decoder), ImportSettings::from(sync_config));
        let notifier = Notifier::new();
        let notifications = notifier.sender();

        let dispatcher = Dispatcher::new(
            spawn_worker(SyncWorker::new(importer, tasks.clone())),
            spawn_worker(CoverWorker::new(
                pool.clone(),
                CoverCache::from_config(&config.covers),
                decoder,
                tasks.clone(),
            )),
            spawn_worker(SearchWorker::new(pool.clone(), index)),
            spawn_worker(notifier),
            spawn_worker(WatchManager::new(pool, watcher, poller, timeout)),
            timeout,
        );
        let join = tokio::spawn(dispatcher.run(rx));

        if !tasks.send(Task::Watch(WatchTask::Reload)) {
            return Err(Error::channel("dispatcher queue closed at startup"));
        }

        Ok(Self {
            tasks,
            notifications,
            batcher: Some(batcher),
            join,
        })
    }

    /// A producer for the dispatcher queue.
    pub fn sender(&self) -> TaskSender {
        self.tasks.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Flush the batcher, then drain and stop every worker.
    pub async fn shutdown(mut self) {
        tracing::info!(target: "tasks::dispatcher", "Shutting down");
        if let Some(batcher) = self.batcher.take()
            && let Err(e) = tokio::task::spawn_blocking(move || batcher.shutdown()).await
        {
            tracing::error!(target: "tasks::dispatcher", error = %e, "Batcher shutdown panicked");
        }
        self.tasks.shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(target: "tasks::dispatcher", error = %e, "Dispatcher panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ComicMetadata;
    use crate::snapshot::SnapshotDiff;
    use crate::tasks::PollTask;
    use crate::tasks::workers::LoggingIndex;
    use crate::test_utils::{StaticDecoder, temp_db, temp_library, write_comic};

    fn test_config(cache_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.sync.wait_for_copies = false;
        config.sync.batch_quiet_ms = 20;
        config.sync.debounce_ms = 20;
        config.sync.shutdown_timeout_secs = 5;
        config.covers.cache_dir = Some(cache_dir.to_path_buf());
        config
    }

    async fn next_change(rx: &mut broadcast::Receiver<Notification>, library_id: i64) {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(Notification::LibraryChanged { library_id: id }) if id == library_id => return,
                    Ok(_) => continue,
                    Err(e) => panic!("notification channel failed: {e}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("no LibraryChanged notification");
    }

    #[tokio::test]
    async fn test_sync_task_reaches_database() {
        let (pool, _db) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let cache = tempfile::tempdir().unwrap();
        let path = write_comic(root.path(), "Saga/Saga 001.cbz");
        let decoder = StaticDecoder::new().with(&path, ComicMetadata::default());

        let handle = DispatcherHandle::start(
            pool.clone(),
            &test_config(cache.path()),
            Arc::new(decoder),
            Arc::new(LoggingIndex::default()),
        )
        .unwrap();
        let mut rx = handle.subscribe();

        let mut diff = SnapshotDiff::default();
        diff.files.created.insert(path.clone());
        assert!(handle.sender().send(Task::Sync(SyncTask { library_id, diff })));

        next_change(&mut rx, library_id).await;
        assert!(crate::db::get_comic_by_path(&pool, library_id, &path).await.unwrap().is_some());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_task_imports_existing_files() {
        let (pool, _db) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let cache = tempfile::tempdir().unwrap();
        let path = write_comic(root.path(), "Saga/Saga 002.cbz");
        let decoder = StaticDecoder::new().with(&path, ComicMetadata::default());

        let handle = DispatcherHandle::start(
            pool.clone(),
            &test_config(cache.path()),
            Arc::new(decoder),
            Arc::new(LoggingIndex::default()),
        )
        .unwrap();
        let mut rx = handle.subscribe();

        assert!(handle.sender().send(Task::Poll(PollTask {
            library_ids: vec![library_id],
            force: false,
        })));

        next_change(&mut rx, library_id).await;
        let comics = crate::db::get_comics(&pool, Some(library_id)).await.unwrap();
        assert_eq!(comics.len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_idle_workers() {
        let (pool, _db) = temp_db().await;
        let cache = tempfile::tempdir().unwrap();
        let handle = DispatcherHandle::start(
            pool,
            &test_config(cache.path()),
            Arc::new(StaticDecoder::new()),
            Arc::new(LoggingIndex::default()),
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
            .await
            .expect("shutdown hung");
    }
}
