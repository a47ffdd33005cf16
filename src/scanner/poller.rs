//! Periodic snapshot polling.
//!
//! For each library with polling enabled, the poller periodically builds
//! a snapshot from the database and one from the live tree, diffs them and
//! hands any changes to the batcher. It is the fallback for filesystems
//! that deliver no reliable OS events, and the way to force a re-import.
//!
//! A missing root, or a root that is suddenly empty while the database
//! still holds entries, is treated as an unmounted volume: the library is
//! backed off instead of having everything deleted.
//!
//! # Usage
//!
//! ```ignore
//! let poller = spawn_poller(pool.clone(), config.sync.clone(), batcher.sender());
//! poller.poll_now(vec![library_id], true);
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::is_comic_archive;
use crate::batcher::BatcherMessage;
use crate::config::SyncConfig;
use crate::db;
use crate::error::{Error, Result};
use crate::model::Library;
use crate::snapshot::{self, Snapshot, SnapshotDiff};
use crate::status::{StatusKind, StatusTracker};

/// Commands that can be sent to the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollCommand {
    /// Poll now, outside the schedule. Empty means every polled library.
    PollNow { library_ids: Vec<i64>, force: bool },
    /// Re-read poll settings from the library table
    Reload,
    /// The library root vanished; back it off like a failed poll
    Unreachable { library_id: i64 },
    /// Stop the poller
    Shutdown,
}

/// Result of polling one library.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Changed(SnapshotDiff),
    Unchanged,
    /// Root missing or suspiciously empty
    Unreachable,
}

/// When one library is next polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub root: PathBuf,
    pub every: Duration,
    pub next_due: Instant,
    /// Set while the library looks unmounted
    pub backed_off: bool,
}

/// Poll schedule shared between the poller task and its handle.
pub type Schedule = Arc<Mutex<HashMap<i64, ScheduleEntry>>>;

/// Poll one library once.
///
/// With `force`, every surviving entry is reported as modified so that
/// it is decoded again.
pub async fn poll_library(pool: &SqlitePool, library: &Library, force: bool) -> Result<PollOutcome> {
    let root = PathBuf::from(&library.path);
    let reference = snapshot::from_database(pool, library.id, force).await?;

    let walk_root = root.clone();
    let walked = tokio::task::spawn_blocking(move || Snapshot::walk(&walk_root, is_comic_archive))
        .await
        .map_err(|e| Error::channel(format!("walk task: {e}")))?;
    let mut live = match walked {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(target: "scanner::poller", library = library.id, path = %root.display(), error = %e, "Library root unreachable");
            return Ok(PollOutcome::Unreachable);
        }
    };
    if live.is_empty() && !reference.is_empty() {
        tracing::warn!(target: "scanner::poller", library = library.id, path = %root.display(), "Library root is empty, suspected unmount");
        return Ok(PollOutcome::Unreachable);
    }
    live.retain_populated_dirs();

    let diff = snapshot::diff(&reference, &live, true);
    db::touch_last_poll(pool, library.id).await?;

    if diff.is_empty() {
        tracing::debug!(target: "scanner::poller", library = library.id, "No changes");
        Ok(PollOutcome::Unchanged)
    } else {
        tracing::info!(target: "scanner::poller", library = library.id, changes = diff.len(), "Changes found");
        Ok(PollOutcome::Changed(diff))
    }
}

/// Handle to a running poller.
pub struct PollerHandle {
    tx: mpsc::UnboundedSender<PollCommand>,
    schedule: Schedule,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Poll now; an empty list means every polled library.
    pub fn poll_now(&self, library_ids: Vec<i64>, force: bool) -> bool {
        self.tx.send(PollCommand::PollNow { library_ids, force }).is_ok()
    }

    /// Re-read library poll settings.
    pub fn reload(&self) -> bool {
        self.tx.send(PollCommand::Reload).is_ok()
    }

    /// A sender for reporting to the poller from other threads.
    pub fn commands(&self) -> mpsc::UnboundedSender<PollCommand> {
        self.tx.clone()
    }

    /// Current schedule entry of a library.
    pub fn schedule_of(&self, library_id: i64) -> Option<ScheduleEntry> {
        self.schedule.lock().get(&library_id).cloned()
    }

    /// Ids of scheduled libraries.
    pub fn scheduled(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.schedule.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop the poller, aborting it after `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.tx.send(PollCommand::Shutdown);
        let mut join = self.join;
        if tokio::time::timeout(timeout, &mut join).await.is_err() {
            tracing::warn!(target: "scanner::poller", "Poller did not stop in time, aborting");
            join.abort();
        }
    }
}

/// Start the poller. Libraries are loaded immediately.
pub fn spawn_poller(pool: SqlitePool, config: SyncConfig, tx: Sender<BatcherMessage>) -> PollerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let schedule: Schedule = Arc::default();
    let poller = Poller {
        pool,
        config,
        tx,
        schedule: Arc::clone(&schedule),
    };
    let join = tokio::spawn(poller.run(cmd_rx));
    PollerHandle {
        tx: cmd_tx,
        schedule,
        join,
    }
}

struct Poller {
    pool: SqlitePool,
    config: SyncConfig,
    tx: Sender<BatcherMessage>,
    schedule: Schedule,
}

impl Poller {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PollCommand>) {
        self.reload().await;
        tracing::info!(target: "scanner::poller", libraries = self.schedule.lock().len(), "Poller started");

        loop {
            let next = self.next_due();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(PollCommand::PollNow { library_ids, force }) => {
                        self.poll_now(library_ids, force).await;
                    }
                    Some(PollCommand::Reload) => self.reload().await,
                    Some(PollCommand::Unreachable { library_id }) => self.back_off(library_id),
                    Some(PollCommand::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(next.into()) => {
                    self.poll_due().await;
                }
            }
        }
        tracing::info!(target: "scanner::poller", "Poller stopped");
    }

    /// Earliest due time, or an hour from now when nothing is scheduled.
    fn next_due(&self) -> Instant {
        self.schedule
            .lock()
            .values()
            .map(|e| e.next_due)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    fn interval(&self, library: &Library) -> Duration {
        Duration::from_secs(library.poll_every_secs.max(0) as u64).max(self.config.poll_min_interval())
    }

    /// Reconcile the schedule with the library table.
    async fn reload(&self) {
        let libraries = match db::get_libraries(&self.pool).await {
            Ok(libraries) => libraries,
            Err(e) => {
                tracing::error!(target: "scanner::poller", error = %e, "Failed to load libraries");
                return;
            }
        };

        let now = Instant::now();
        let mut schedule = self.schedule.lock();
        schedule.retain(|id, _| libraries.iter().any(|l| l.id == *id && l.poll));
        for library in libraries.iter().filter(|l| l.poll) {
            let every = self.interval(library);
            let root = PathBuf::from(&library.path);
            schedule
                .entry(library.id)
                .and_modify(|entry| {
                    if entry.every != every {
                        entry.next_due = now + every;
                    }
                    entry.every = every;
                    entry.root = root.clone();
                })
                .or_insert_with(|| ScheduleEntry {
                    root,
                    every,
                    next_due: now + every,
                    backed_off: false,
                });
        }
    }

    /// Push a library whose root vanished out by the unreachable backoff.
    fn back_off(&self, library_id: i64) {
        let mut schedule = self.schedule.lock();
        let Some(entry) = schedule.get_mut(&library_id) else {
            tracing::debug!(target: "scanner::poller", library = library_id, "Unreachable library is not polled");
            return;
        };
        entry.next_due = Instant::now() + self.config.unreachable_backoff().max(entry.every);
        entry.backed_off = true;
        tracing::warn!(target: "scanner::poller", library = library_id, "Library unreachable, backing off");
    }

    async fn poll_due(&self) {
        let now = Instant::now();
        let due: Vec<i64> = self
            .schedule
            .lock()
            .iter()
            .filter(|(_, e)| e.next_due <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.poll_one(id, false).await;
        }
    }

    async fn poll_now(&self, library_ids: Vec<i64>, force: bool) {
        let ids = if library_ids.is_empty() {
            let mut ids: Vec<i64> = self.schedule.lock().keys().copied().collect();
            ids.sort_unstable();
            ids
        } else {
            library_ids
        };
        for id in ids {
            self.poll_one(id, force).await;
        }
    }

    async fn poll_one(&self, library_id: i64, force: bool) {
        let library = match db::get_library(&self.pool, library_id).await {
            Ok(library) => library,
            Err(e) => {
                tracing::warn!(target: "scanner::poller", library = library_id, error = %e, "Cannot poll library");
                self.schedule.lock().remove(&library_id);
                return;
            }
        };

        let tracker = StatusTracker::start(&self.pool, StatusKind::Poll, Some(1)).await;
        let outcome = poll_library(&self.pool, &library, force).await;
        tracker.finish().await;

        let now = Instant::now();
        let every = self.interval(&library);
        let next_due = match &outcome {
            Ok(PollOutcome::Unreachable) => now + self.config.unreachable_backoff().max(every),
            _ => now + every,
        };
        if let Some(entry) = self.schedule.lock().get_mut(&library_id) {
            entry.next_due = next_due;
            entry.backed_off = matches!(outcome, Ok(PollOutcome::Unreachable));
        }

        match outcome {
            Ok(PollOutcome::Changed(diff)) => {
                if self.tx.send(BatcherMessage::Diff { library_id, diff }).is_err() {
                    tracing::warn!(target: "scanner::poller", library = library_id, "Batcher is gone, dropping diff");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(target: "scanner::poller", library = library_id, error = %e, "Poll failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::{ImportSettings, Importer};
    use crate::metadata::ComicMetadata;
    use crate::test_utils::{StaticDecoder, temp_db, temp_library, write_comic};
    use crossbeam_channel::unbounded;

    #[tokio::test]
    async fn test_poll_finds_new_files_and_folders() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let path = write_comic(root.path(), "Saga/Saga 001.cbz");
        std::fs::create_dir_all(root.path().join("Empty")).unwrap();
        let library = db::get_library(&pool, library_id).await.unwrap();

        let outcome = poll_library(&pool, &library, false).await.unwrap();
        let PollOutcome::Changed(diff) = outcome else {
            panic!("expected changes, got {outcome:?}");
        };
        assert!(diff.files.created.contains(&path));
        assert!(diff.dirs.created.contains(&root.path().join("Saga")));
        assert!(!diff.dirs.created.contains(&root.path().join("Empty")));

        let library = db::get_library(&pool, library_id).await.unwrap();
        assert!(library.last_poll.is_some());
    }

    #[tokio::test]
    async fn test_poll_after_import_is_unchanged_unless_forced() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let path = write_comic(root.path(), "Saga/a.cbz");
        let library = db::get_library(&pool, library_id).await.unwrap();
        let decoder = StaticDecoder::new().with(&path, ComicMetadata::default());
        let settings = ImportSettings {
            wait_for_copies: false,
            ..Default::default()
        };
        let importer = Importer::new(pool.clone(), Arc::new(decoder), settings);

        let PollOutcome::Changed(diff) = poll_library(&pool, &library, false).await.unwrap() else {
            panic!("expected the new comic");
        };
        importer.apply(library_id, diff).await.unwrap();

        assert_eq!(poll_library(&pool, &library, false).await.unwrap(), PollOutcome::Unchanged);

        let outcome = poll_library(&pool, &library, true).await.unwrap();
        let PollOutcome::Changed(diff) = outcome else {
            panic!("forced poll found nothing");
        };
        assert_eq!(diff.files.modified, [path].into());
        assert_eq!(diff.dirs.modified, [root.path().join("Saga")].into());
        assert!(diff.files.created.is_empty() && diff.files.deleted.is_empty());
        assert!(diff.dirs.created.is_empty() && diff.dirs.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_is_unreachable() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let library = db::get_library(&pool, library_id).await.unwrap();
        drop(root);

        let outcome = poll_library(&pool, &library, false).await.unwrap();
        assert_eq!(outcome, PollOutcome::Unreachable);
    }

    #[tokio::test]
    async fn test_emptied_root_is_not_mass_deletion() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        sqlx::query("INSERT INTO folders (library_id, path, name, stat) VALUES (?, ?, 'Saga', NULL)")
            .bind(library_id)
            .bind(db::path_str(&root.path().join("Saga")))
            .execute(&pool)
            .await
            .unwrap();
        let library = db::get_library(&pool, library_id).await.unwrap();

        let outcome = poll_library(&pool, &library, false).await.unwrap();
        assert_eq!(outcome, PollOutcome::Unreachable);
    }

    #[tokio::test]
    async fn test_poll_now_forwards_diff_to_batcher() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        write_comic(root.path(), "1.cbz");
        let (tx, rx) = unbounded();

        let poller = spawn_poller(pool.clone(), SyncConfig::default(), tx);
        assert!(poller.poll_now(vec![library_id], false));

        let msg = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        match msg {
            BatcherMessage::Diff { library_id: id, diff } => {
                assert_eq!(id, library_id);
                assert_eq!(diff.files.created.len(), 1);
            }
            other => panic!("unexpected message {other:?}"),
        }

        assert_eq!(poller.scheduled(), vec![library_id]);
        let entry = poller.schedule_of(library_id).unwrap();
        assert!(!entry.backed_off);
        assert!(entry.every >= SyncConfig::default().poll_min_interval());
        poller.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_unreachable_report_backs_off() {
        let (pool, _dir) = temp_db().await;
        let (library_id, _root) = temp_library(&pool).await;
        let (tx, _rx) = unbounded();
        let config = SyncConfig::default();
        let poller = spawn_poller(pool.clone(), config.clone(), tx);

        // Wait for the initial load
        for _ in 0..100 {
            if !poller.scheduled().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let before = poller.schedule_of(library_id).unwrap();
        assert!(!before.backed_off);

        poller
            .commands()
            .send(PollCommand::Unreachable { library_id })
            .unwrap();
        let mut entry = before.clone();
        for _ in 0..100 {
            entry = poller.schedule_of(library_id).unwrap();
            if entry.backed_off {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(entry.backed_off);
        assert!(entry.next_due >= before.next_due);
        assert!(entry.next_due >= Instant::now() + config.unreachable_backoff() - Duration::from_secs(5));
        poller.shutdown(Duration::from_secs(2)).await;
    }
}
