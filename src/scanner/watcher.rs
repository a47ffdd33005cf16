//! File system watcher for live library changes.
//!
//! Uses the `notify` crate with the full debouncer, which stitches rename
//! pairs together through its file-id cache, and forwards single-path
//! [`FsEvent`]s to the batcher.
//!
//! # Design
//!
//! - **Debounced events**: rapid changes to one path coalesce before they
//!   reach the batcher
//! - **Archives and directories only**: other files are ignored, except
//!   renames that cross the archive boundary (renaming `a.tmp` to `a.cbz`
//!   is a create, the reverse is a delete)
//! - **Library attribution**: each event goes to the library with the
//!   longest root containing it; a vanished root is reported to the
//!   poller, which backs the library off, and is never forwarded as a
//!   deletion
//! - **Graceful shutdown**: dropping the handle stops the watcher
//!
//! # Usage
//!
//! ```rust,ignore
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let mut watcher = FileWatcher::new(Duration::from_millis(500), tx)?;
//! watcher.watch_library(1, Path::new("/comics"))?;
//! ```

use crossbeam_channel::Sender;
use notify::{
    EventKind, RecommendedWatcher, RecursiveMode,
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use super::{FsEvent, LibraryEvent, LibraryRoots, PollCommand, is_comic_archive};
use crate::batcher::BatcherMessage;

/// Handle to a running file watcher.
///
/// Dropping this handle will stop the watcher.
pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    roots: Arc<RwLock<LibraryRoots>>,
    running: Arc<AtomicBool>,
    poller: Arc<Mutex<Option<UnboundedSender<PollCommand>>>>,
}

impl FileWatcher {
    /// Create a watcher that forwards events to the batcher.
    ///
    /// No library is watched until [`FileWatcher::watch_library`] is called.
    pub fn new(debounce: Duration, tx: Sender<BatcherMessage>) -> Result<Self, WatchError> {
        let roots = Arc::new(RwLock::new(LibraryRoots::default()));
        let running = Arc::new(AtomicBool::new(true));

        let poller: Arc<Mutex<Option<UnboundedSender<PollCommand>>>> = Arc::default();

        let handler_roots = Arc::clone(&roots);
        let handler_running = Arc::clone(&running);
        let handler_poller = Arc::clone(&poller);
        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            if !handler_running.load(Ordering::Relaxed) {
                return;
            }
            Self::handle_debounced_events(result, &handler_roots.read(), &tx, handler_poller.lock().as_ref());
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;

        Ok(Self {
            debouncer,
            roots,
            running,
            poller,
        })
    }

    /// Send vanished library roots to the poller so it backs them off.
    pub fn report_unreachable_to(&self, poller: UnboundedSender<PollCommand>) {
        *self.poller.lock() = Some(poller);
    }

    /// Start watching a library root.
    pub fn watch_library(&mut self, library_id: i64, root: &Path) -> Result<(), WatchError> {
        if !root.is_dir() {
            tracing::warn!(target: "scanner::watcher", library = library_id, path = %root.display(), "Library unreachable, not watching");
            return Err(WatchError::Unreachable(root.to_path_buf()));
        }

        if let Some(old) = self.roots.write().remove(library_id) {
            let _ = self.debouncer.unwatch(&old);
        }

        tracing::info!(target: "scanner::watcher", library = library_id, path = %root.display(), "Watching library");
        self.debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Watch(e.to_string()))?;
        self.roots.write().insert(library_id, root.to_path_buf());
        Ok(())
    }

    /// Stop watching a library. Unknown ids are ignored.
    pub fn unwatch_library(&mut self, library_id: i64) -> Result<(), WatchError> {
        let Some(root) = self.roots.write().remove(library_id) else {
            return Ok(());
        };
        tracing::info!(target: "scanner::watcher", library = library_id, path = %root.display(), "Unwatching library");
        self.debouncer
            .unwatch(&root)
            .map_err(|e| WatchError::Watch(e.to_string()))
    }

    /// Ids of the libraries currently watched.
    pub fn watched(&self) -> Vec<i64> {
        self.roots.read().ids().collect()
    }

    /// Handle debounced events from notify.
    fn handle_debounced_events(
        result: DebounceEventResult,
        roots: &LibraryRoots,
        tx: &Sender<BatcherMessage>,
        poller: Option<&UnboundedSender<PollCommand>>,
    ) {
        match result {
            Ok(events) => {
                for event in events {
                    if vanished_root(&event, roots, poller) {
                        continue;
                    }
                    for fs_event in classify(&event) {
                        for library_event in attribute(fs_event, roots) {
                            tracing::debug!(target: "scanner::watcher", library = library_event.library_id, event = ?library_event.event, "Change");
                            if tx.send(BatcherMessage::Event(library_event)).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(errors) => {
                for error in errors {
                    tracing::warn!(target: "scanner::watcher", error = %error, "Watch error");
                }
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        tracing::debug!(target: "scanner::watcher", "File watcher stopped");
    }
}

/// Report an event on a library root that no longer exists.
///
/// Returns true when the event touched such a root; it must not be
/// treated as a deletion of the library's contents.
fn vanished_root(event: &notify::Event, roots: &LibraryRoots, poller: Option<&UnboundedSender<PollCommand>>) -> bool {
    let Some(root) = event.paths.iter().find(|p| roots.is_root(p)) else {
        return false;
    };
    if root.is_dir() {
        return false;
    }
    let Some(library_id) = roots.library_at(root) else {
        return false;
    };
    tracing::warn!(target: "scanner::watcher", library = library_id, path = %root.display(), "Library root vanished, suspected unmount");
    if let Some(poller) = poller
        && poller.send(PollCommand::Unreachable { library_id }).is_err()
    {
        tracing::warn!(target: "scanner::watcher", library = library_id, "Poller is gone, library not backed off");
    }
    true
}

/// Map a notify event to the archive and directory changes it implies.
pub fn classify(event: &notify::Event) -> Vec<FsEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                out.extend(appeared(path, matches!(kind, CreateKind::Folder)));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [src, dest] = event.paths.as_slice() {
                out.extend(renamed(src, dest));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                out.extend(vanished(path, None));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                out.extend(appeared(path, false));
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in &event.paths {
                if path.exists() {
                    out.extend(appeared(path, false));
                } else {
                    out.extend(vanished(path, None));
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                if path.is_dir() {
                    out.push(FsEvent::Modified {
                        path: path.clone(),
                        is_dir: true,
                    });
                } else if is_comic_archive(path) {
                    out.push(FsEvent::Modified {
                        path: path.clone(),
                        is_dir: false,
                    });
                }
            }
        }
        EventKind::Remove(kind) => {
            let hint = match kind {
                RemoveKind::Folder => Some(true),
                RemoveKind::File => Some(false),
                _ => None,
            };
            for path in &event.paths {
                out.extend(vanished(path, hint));
            }
        }
        _ => {}
    }
    out
}

fn appeared(path: &Path, known_dir: bool) -> Option<FsEvent> {
    let is_dir = known_dir || path.is_dir();
    (is_dir || is_comic_archive(path)).then(|| FsEvent::Created {
        path: path.to_path_buf(),
        is_dir,
    })
}

/// A vanished path can no longer be stat'ed; without a hint, anything that
/// is not an archive is assumed to have been a directory.
fn vanished(path: &Path, is_dir: Option<bool>) -> Option<FsEvent> {
    let is_dir = match is_dir {
        Some(true) => true,
        Some(false) if is_comic_archive(path) => false,
        Some(false) => return None,
        None => !is_comic_archive(path),
    };
    Some(FsEvent::Deleted {
        path: path.to_path_buf(),
        is_dir,
    })
}

fn renamed(src: &Path, dest: &Path) -> Option<FsEvent> {
    if dest.is_dir() {
        return Some(FsEvent::Moved {
            src: src.to_path_buf(),
            dest: dest.to_path_buf(),
            is_dir: true,
        });
    }
    match (is_comic_archive(src), is_comic_archive(dest)) {
        (true, true) => Some(FsEvent::Moved {
            src: src.to_path_buf(),
            dest: dest.to_path_buf(),
            is_dir: false,
        }),
        (true, false) => Some(FsEvent::Deleted {
            path: src.to_path_buf(),
            is_dir: false,
        }),
        (false, true) => Some(FsEvent::Created {
            path: dest.to_path_buf(),
            is_dir: false,
        }),
        (false, false) => None,
    }
}

/// Attach library ids. A move across libraries, or into or out of every
/// library, becomes a delete on one side and a create on the other.
fn attribute(event: FsEvent, roots: &LibraryRoots) -> Vec<LibraryEvent> {
    let single = |library_id: Option<i64>, event: FsEvent| {
        library_id
            .map(|library_id| LibraryEvent { library_id, event })
            .into_iter()
            .collect::<Vec<_>>()
    };

    match event {
        FsEvent::Moved { src, dest, is_dir } => {
            let from = roots.library_for(&src);
            let to = roots.library_for(&dest);
            if from.is_some() && from == to {
                return single(from, FsEvent::Moved { src, dest, is_dir });
            }
            let mut out = single(from, FsEvent::Deleted { path: src, is_dir });
            out.extend(single(to, FsEvent::Created { path: dest, is_dir }));
            out
        }
        other => single(roots.library_for(other.path()), other),
    }
}

/// Errors that can occur during file watching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {0}")]
    Init(String),
    #[error("Failed to watch path: {0}")]
    Watch(String),
    #[error("Library root unreachable: {0}")]
    Unreachable(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::Event;
    use std::fs;
    use tempfile::tempdir;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(path.to_path_buf());
        }
        event
    }

    #[test]
    fn test_create_filters_non_archives() {
        let dir = tempdir().unwrap();
        let comic = dir.path().join("a.cbz");
        let text = dir.path().join("notes.txt");
        let sub = dir.path().join("Marvel");
        fs::write(&comic, b"PK").unwrap();
        fs::write(&text, b"x").unwrap();
        fs::create_dir(&sub).unwrap();

        let out = classify(&event(
            EventKind::Create(CreateKind::Any),
            &[&comic, &text, &sub],
        ));
        assert_eq!(
            out,
            vec![
                FsEvent::Created { path: comic, is_dir: false },
                FsEvent::Created { path: sub, is_dir: true },
            ]
        );
    }

    #[test]
    fn test_rename_across_archive_boundary() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("a.part");
        let comic = dir.path().join("a.cbz");
        let backup = dir.path().join("a.bak");

        let into = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[&tmp, &comic],
        ));
        assert_eq!(into, vec![FsEvent::Created { path: comic.clone(), is_dir: false }]);

        let out_of = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[&comic, &backup],
        ));
        assert_eq!(out_of, vec![FsEvent::Deleted { path: comic.clone(), is_dir: false }]);

        let neither = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[&tmp, &backup],
        ));
        assert!(neither.is_empty());
    }

    #[test]
    fn test_rename_directory_is_move() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("Old");
        let dest = dir.path().join("New");
        fs::create_dir(&dest).unwrap();

        let out = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[&src, &dest],
        ));
        assert_eq!(out, vec![FsEvent::Moved { src, dest, is_dir: true }]);
    }

    #[test]
    fn test_remove_without_hint() {
        let out = classify(&event(
            EventKind::Remove(RemoveKind::Any),
            &[Path::new("/lib/a.cbr"), Path::new("/lib/Gone")],
        ));
        assert_eq!(
            out,
            vec![
                FsEvent::Deleted { path: PathBuf::from("/lib/a.cbr"), is_dir: false },
                FsEvent::Deleted { path: PathBuf::from("/lib/Gone"), is_dir: true },
            ]
        );

        let ignored = classify(&event(
            EventKind::Remove(RemoveKind::File),
            &[Path::new("/lib/notes.txt")],
        ));
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_move_between_libraries_splits() {
        let mut roots = LibraryRoots::default();
        roots.insert(1, PathBuf::from("/a"));
        roots.insert(2, PathBuf::from("/b"));

        let out = attribute(
            FsEvent::Moved {
                src: PathBuf::from("/a/x.cbz"),
                dest: PathBuf::from("/b/x.cbz"),
                is_dir: false,
            },
            &roots,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].library_id, 1);
        assert!(matches!(out[0].event, FsEvent::Deleted { .. }));
        assert_eq!(out[1].library_id, 2);
        assert!(matches!(out[1].event, FsEvent::Created { .. }));

        let outside = attribute(
            FsEvent::Created {
                path: PathBuf::from("/elsewhere/x.cbz"),
                is_dir: false,
            },
            &roots,
        );
        assert!(outside.is_empty());
    }

    #[test]
    fn test_watch_missing_root_is_unreachable() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut watcher = FileWatcher::new(Duration::from_millis(50), tx).unwrap();

        let result = watcher.watch_library(1, &dir.path().join("unmounted"));
        assert!(matches!(result, Err(WatchError::Unreachable(_))));
        assert!(watcher.watched().is_empty());
    }

    #[test]
    fn test_watcher_detects_new_comic() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = FileWatcher::new(Duration::from_millis(50), tx).unwrap();
        watcher.watch_library(7, &root).unwrap();
        assert_eq!(watcher.watched(), vec![7]);

        fs::write(root.join("new.cbz"), b"PK\x03\x04").unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2));
        drop(watcher);

        // Some filesystems deliver late or not at all; only check what arrived
        if let Ok(BatcherMessage::Event(LibraryEvent { library_id, event })) = event {
            assert_eq!(library_id, 7);
            assert_eq!(event.path().file_name().unwrap(), "new.cbz");
        }
    }

    #[test]
    fn test_vanished_root_is_reported_to_poller() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Comics");
        fs::create_dir(&root).unwrap();
        let mut roots = LibraryRoots::default();
        roots.insert(7, root.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let removed = event(EventKind::Remove(RemoveKind::Folder), &[&root]);
        assert!(!vanished_root(&removed, &roots, Some(&tx)));
        assert!(rx.try_recv().is_err());

        fs::remove_dir(&root).unwrap();
        assert!(vanished_root(&removed, &roots, Some(&tx)));
        assert_eq!(rx.try_recv().unwrap(), PollCommand::Unreachable { library_id: 7 });

        // Paths below a root are ordinary deletions
        let inner = event(EventKind::Remove(RemoveKind::File), &[&root.join("a.cbz")]);
        assert!(!vanished_root(&inner, &roots, Some(&tx)));
    }
}
