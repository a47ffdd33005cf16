//! Change sources: live OS events and periodic snapshot polling.
//!
//! Both producers feed the [`crate::batcher`]. The [`FileWatcher`] turns OS
//! notifications into single-path [`FsEvent`]s; the [`poller`] compares a
//! database snapshot with the live tree and hands over whole diffs.
//! Neither treats a vanished or empty library root as mass deletion.

pub mod poller;
mod watcher;

pub use poller::{PollCommand, PollerHandle, spawn_poller};
pub use watcher::{FileWatcher, WatchError, classify};

use std::path::{Path, PathBuf};

/// Extensions the engine imports, lowercase.
pub const COMIC_EXTENSIONS: &[&str] = &["cbz", "cbr", "cb7", "cbt", "pdf"];

/// Check if a path names a comic archive by extension (case-insensitive).
pub fn is_comic_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            COMIC_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// A single-path filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created { path: PathBuf, is_dir: bool },
    Modified { path: PathBuf, is_dir: bool },
    Deleted { path: PathBuf, is_dir: bool },
    Moved { src: PathBuf, dest: PathBuf, is_dir: bool },
}

impl FsEvent {
    /// The path the event leaves behind (destination for moves).
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created { path, .. }
            | FsEvent::Modified { path, .. }
            | FsEvent::Deleted { path, .. } => path,
            FsEvent::Moved { dest, .. } => dest,
        }
    }

    pub fn is_dir(&self) -> bool {
        match self {
            FsEvent::Created { is_dir, .. }
            | FsEvent::Modified { is_dir, .. }
            | FsEvent::Deleted { is_dir, .. }
            | FsEvent::Moved { is_dir, .. } => *is_dir,
        }
    }
}

/// An event attributed to the library whose root contains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryEvent {
    pub library_id: i64,
    pub event: FsEvent,
}

/// Watched library roots, for attributing paths to libraries.
#[derive(Debug, Clone, Default)]
pub struct LibraryRoots {
    roots: Vec<(i64, PathBuf)>,
}

impl LibraryRoots {
    pub fn insert(&mut self, library_id: i64, root: PathBuf) {
        self.remove(library_id);
        self.roots.push((library_id, root));
        // Longest root first so nested libraries win
        self.roots
            .sort_by(|a, b| b.1.components().count().cmp(&a.1.components().count()));
    }

    pub fn remove(&mut self, library_id: i64) -> Option<PathBuf> {
        let pos = self.roots.iter().position(|(id, _)| *id == library_id)?;
        Some(self.roots.remove(pos).1)
    }

    pub fn root_of(&self, library_id: i64) -> Option<&Path> {
        self.roots
            .iter()
            .find(|(id, _)| *id == library_id)
            .map(|(_, root)| root.as_path())
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.roots.iter().map(|(id, _)| *id)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// The library strictly containing `path`. Roots themselves are not
    /// inside their own library.
    pub fn library_for(&self, path: &Path) -> Option<i64> {
        self.roots
            .iter()
            .find(|(_, root)| path != root && path.starts_with(root))
            .map(|(id, _)| *id)
    }

    /// True if `path` is one of the roots.
    pub fn is_root(&self, path: &Path) -> bool {
        self.library_at(path).is_some()
    }

    /// The library whose root is exactly `path`.
    pub fn library_at(&self, path: &Path) -> Option<i64> {
        self.roots.iter().find(|(_, root)| root == path).map(|(id, _)| *id)
    }
}
