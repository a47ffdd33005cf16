//! Event batching.
//!
//! Single-path events from the watcher and whole diffs from the poller are
//! folded into one pending [`SnapshotDiff`] per library. A library's batch
//! is flushed as one [`SyncTask`] when it has been quiet for a while, when
//! it grows past a hard operation cap, or when it has been pending for
//! longer than a maximum wait even though events keep coming.
//!
//! The batcher runs on its own thread and blocks on a crossbeam channel
//! with a timeout re-armed after every message.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::config::SyncConfig;
use crate::scanner::{FsEvent, LibraryEvent};
use crate::snapshot::{ChangeSet, SnapshotDiff};
use crate::tasks::{SyncTask, Task, TaskSender};

/// How long the batcher sleeps when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Input to the batcher thread.
#[derive(Debug, Clone)]
pub enum BatcherMessage {
    /// One live change
    Event(LibraryEvent),
    /// A whole poll diff for one library
    Diff { library_id: i64, diff: SnapshotDiff },
    /// Flush every pending batch now
    Flush,
    /// Flush everything and stop
    Shutdown,
}

/// Flush triggers.
#[derive(Debug, Clone, Copy)]
pub struct BatcherSettings {
    pub quiet: Duration,
    pub max_ops: usize,
    pub max_wait: Duration,
}

impl From<&SyncConfig> for BatcherSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            quiet: config.batch_quiet(),
            max_ops: config.batch_max_ops.max(1),
            max_wait: config.batch_max_wait(),
        }
    }
}

/// Pending changes of one library.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    diff: SnapshotDiff,
    first_event: Instant,
    last_event: Instant,
    ops: usize,
}

impl PendingBatch {
    pub fn new(now: Instant) -> Self {
        Self {
            diff: SnapshotDiff::default(),
            first_event: now,
            last_event: now,
            ops: 0,
        }
    }

    /// Operations added so far, including ones that cancelled out.
    pub fn ops(&self) -> usize {
        self.ops
    }

    /// When this batch must be flushed if nothing else happens.
    pub fn deadline(&self, settings: &BatcherSettings) -> Instant {
        (self.last_event + settings.quiet).min(self.first_event + settings.max_wait)
    }

    /// Fold one event into the batch.
    pub fn add(&mut self, event: FsEvent, now: Instant) {
        self.ops += 1;
        self.last_event = now;

        match event {
            FsEvent::Created { path, is_dir } => {
                let set = self.diff_set(is_dir);
                if set.deleted.remove(&path) {
                    // Deleted then recreated: the entry was replaced
                    set.modified.insert(path);
                } else {
                    set.created.insert(path);
                }
            }
            FsEvent::Modified { path, is_dir } => {
                let set = self.diff_set(is_dir);
                if !set.created.contains(&path) {
                    set.modified.insert(path);
                }
            }
            FsEvent::Deleted { path, is_dir } => {
                let set = self.diff_set(is_dir);
                set.modified.remove(&path);
                let was_created = set.created.remove(&path);
                let mut was_moved = false;
                // The moved entry is gone; what the store knows is at src
                while let Some(src) = move_source(&set.moved, &path) {
                    set.moved.remove(&src);
                    delete_source(set, src);
                    was_moved = true;
                }
                if !was_created && !was_moved {
                    set.deleted.insert(path);
                }
            }
            FsEvent::Moved { src, dest, is_dir } => {
                self.add_move(src, dest, is_dir);
            }
        }
    }

    fn add_move(&mut self, src: PathBuf, dest: PathBuf, is_dir: bool) {
        if is_dir {
            // Pending children follow their directory
            for set in [&mut self.diff.dirs, &mut self.diff.files] {
                set.created = rebase_all(std::mem::take(&mut set.created), &src, &dest);
                set.modified = rebase_all(std::mem::take(&mut set.modified), &src, &dest);
            }
        }

        let set = self.diff_set(is_dir);
        set.deleted.remove(&dest);

        let was_modified = set.modified.remove(&src);
        if set.created.remove(&src) {
            set.created.insert(dest);
            return;
        }

        match move_source(&set.moved, &src) {
            Some(origin) if origin == dest => {
                // Moved back where it started
                set.moved.remove(&origin);
            }
            Some(origin) => {
                set.moved.insert(origin, dest.clone());
            }
            None => {
                set.moved.insert(src, dest.clone());
            }
        }
        if was_modified {
            set.modified.insert(dest);
        }
    }

    /// Fold a whole diff into the batch, as a sequence of events.
    pub fn merge(&mut self, diff: SnapshotDiff, now: Instant) {
        for (is_dir, set) in [(true, diff.dirs), (false, diff.files)] {
            for (src, dest) in set.moved {
                self.add(FsEvent::Moved { src, dest, is_dir }, now);
            }
            for path in set.deleted {
                self.add(FsEvent::Deleted { path, is_dir }, now);
            }
            for path in set.created {
                self.add(FsEvent::Created { path, is_dir }, now);
            }
            for path in set.modified {
                self.add(FsEvent::Modified { path, is_dir }, now);
            }
        }
    }

    /// Apply the flush-time coalescing rules and return the diff.
    pub fn finish(mut self) -> SnapshotDiff {
        coalesce(&mut self.diff.dirs);
        coalesce(&mut self.diff.files);
        self.diff
    }

    fn diff_set(&mut self, is_dir: bool) -> &mut ChangeSet {
        if is_dir {
            &mut self.diff.dirs
        } else {
            &mut self.diff.files
        }
    }
}

fn move_source(moved: &BTreeMap<PathBuf, PathBuf>, dest: &Path) -> Option<PathBuf> {
    moved
        .iter()
        .find(|(_, d)| d.as_path() == dest)
        .map(|(s, _)| s.clone())
}

/// Delete the stored entry at a move source, unless another move already
/// lands on that path (the move replaces it).
fn delete_source(set: &mut ChangeSet, src: PathBuf) {
    if !set.moved.values().any(|d| *d == src) {
        set.deleted.insert(src);
    }
}

fn rebase_all(
    paths: std::collections::BTreeSet<PathBuf>,
    src: &Path,
    dest: &Path,
) -> std::collections::BTreeSet<PathBuf> {
    paths
        .into_iter()
        .map(|p| match p.strip_prefix(src) {
            Ok(rest) if !rest.as_os_str().is_empty() => dest.join(rest),
            _ => p,
        })
        .collect()
}

fn coalesce(set: &mut ChangeSet) {
    // Moved into a path that was later deleted
    let doomed: Vec<(PathBuf, PathBuf)> = set
        .moved
        .iter()
        .filter(|(_, dest)| set.deleted.contains(*dest))
        .map(|(s, d)| (s.clone(), d.clone()))
        .collect();
    for (src, _) in doomed {
        set.moved.remove(&src);
        delete_source(set, src);
    }

    // Created and deleted in the same window
    let cancelled: Vec<PathBuf> = set.created.intersection(&set.deleted).cloned().collect();
    for path in cancelled {
        set.created.remove(&path);
        set.deleted.remove(&path);
    }

    for dest in set.moved.values() {
        set.created.remove(dest);
    }

    set.modified
        .retain(|p| !set.created.contains(p) && !set.deleted.contains(p));
}

/// Per-library batches plus the flush policy.
pub struct Batcher {
    settings: BatcherSettings,
    pending: HashMap<i64, PendingBatch>,
    tasks: TaskSender,
}

impl Batcher {
    pub fn new(settings: BatcherSettings, tasks: TaskSender) -> Self {
        Self {
            settings,
            pending: HashMap::new(),
            tasks,
        }
    }

    /// Number of libraries with pending changes.
    pub fn pending_libraries(&self) -> usize {
        self.pending.len()
    }

    pub fn handle_event(&mut self, event: LibraryEvent, now: Instant) {
        let library_id = event.library_id;
        self.pending
            .entry(library_id)
            .or_insert_with(|| PendingBatch::new(now))
            .add(event.event, now);
        self.flush_if_full(library_id);
    }

    pub fn handle_diff(&mut self, library_id: i64, diff: SnapshotDiff, now: Instant) {
        if diff.is_empty() {
            return;
        }
        self.pending
            .entry(library_id)
            .or_insert_with(|| PendingBatch::new(now))
            .merge(diff, now);
        self.flush_if_full(library_id);
    }

    fn flush_if_full(&mut self, library_id: i64) {
        let full = self
            .pending
            .get(&library_id)
            .is_some_and(|b| b.ops() >= self.settings.max_ops);
        if full {
            tracing::debug!(target: "batcher", library = library_id, max_ops = self.settings.max_ops, "Batch cap reached");
            self.flush(library_id);
        }
    }

    /// Earliest moment any batch is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|b| b.deadline(&self.settings))
            .min()
    }

    /// Flush every batch whose deadline has passed.
    pub fn flush_due(&mut self, now: Instant) {
        let due: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, b)| b.deadline(&self.settings) <= now)
            .map(|(id, _)| *id)
            .collect();
        for library_id in due {
            self.flush(library_id);
        }
    }

    pub fn flush_all(&mut self) {
        let ids: Vec<i64> = self.pending.keys().copied().collect();
        for library_id in ids {
            self.flush(library_id);
        }
    }

    fn flush(&mut self, library_id: i64) {
        let Some(batch) = self.pending.remove(&library_id) else {
            return;
        };
        let ops = batch.ops();
        let diff = batch.finish();
        if diff.is_empty() {
            tracing::debug!(target: "batcher", library = library_id, ops, "Batch cancelled out");
            return;
        }

        tracing::info!(
            target: "batcher",
            library = library_id,
            ops,
            changes = diff.len(),
            "Flushing batch"
        );
        if !self.tasks.send(Task::Sync(SyncTask { library_id, diff })) {
            tracing::warn!(target: "batcher", library = library_id, "Dispatcher gone, dropping batch");
        }
    }

    /// Process messages until shutdown or until every sender is dropped.
    pub fn run(mut self, rx: Receiver<BatcherMessage>) {
        loop {
            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT);

            match rx.recv_timeout(timeout) {
                Ok(BatcherMessage::Event(event)) => self.handle_event(event, Instant::now()),
                Ok(BatcherMessage::Diff { library_id, diff }) => {
                    self.handle_diff(library_id, diff, Instant::now())
                }
                Ok(BatcherMessage::Flush) => self.flush_all(),
                Ok(BatcherMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush_all();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.flush_due(Instant::now());
        }
        tracing::debug!(target: "batcher", "Batcher stopped");
    }
}

/// Handle to the batcher thread.
pub struct BatcherHandle {
    tx: Sender<BatcherMessage>,
    thread: Option<JoinHandle<()>>,
}

impl BatcherHandle {
    /// A sender for change sources.
    pub fn sender(&self) -> Sender<BatcherMessage> {
        self.tx.clone()
    }

    /// Flush pending batches and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(BatcherMessage::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(target: "batcher", "Batcher thread panicked");
        }
    }
}

/// Start the batcher on its own thread.
pub fn spawn_batcher(
    settings: BatcherSettings,
    tasks: TaskSender,
) -> std::io::Result<BatcherHandle> {
    let (tx, rx) = unbounded();
    let batcher = Batcher::new(settings, tasks);
    let thread = std::thread::Builder::new()
        .name("batcher".into())
        .spawn(move || batcher.run(rx))?;
    Ok(BatcherHandle {
        tx,
        thread: Some(thread),
    })
}
