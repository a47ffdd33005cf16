//! Point-in-time views of a library tree.
//!
//! A [`Snapshot`] maps every descendant path of a library root to its
//! inode, device, size and mtime. Snapshots come from two places:
//!
//! - [`Snapshot::walk`] reads the live filesystem
//! - [`from_database`] materialises the persisted watched entries as a
//!   synthetic snapshot, without touching disk except to re-verify
//!   entries whose stored stat is unusable
//!
//! Two snapshots are compared with [`diff::diff`].

pub mod diff;

pub use diff::{ChangeSet, SnapshotDiff, diff};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use walkdir::WalkDir;

use crate::db;
use crate::error::Result;
use crate::model::StatTuple;

/// Stat fields of one snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryStat {
    pub inode: u64,
    /// Informational only; identity never depends on it
    pub device: u64,
    pub size: u64,
    pub mtime: f64,
    pub is_dir: bool,
}

impl EntryStat {
    pub fn from_stat(stat: &StatTuple) -> Self {
        Self {
            inode: stat.inode,
            device: 0,
            size: stat.size,
            mtime: stat.mtime,
            is_dir: stat.is_dir(),
        }
    }

    fn from_metadata(md: &std::fs::Metadata) -> Self {
        let mut entry = Self::from_stat(&StatTuple::from_metadata(md));
        entry.device = device_of(md);
        entry
    }
}

#[cfg(unix)]
fn device_of(md: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.dev()
}

#[cfg(not(unix))]
fn device_of(_md: &std::fs::Metadata) -> u64 {
    0
}

/// A comparable view of a directory tree.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: HashMap<PathBuf, EntryStat>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, stat: EntryStat) {
        self.entries.insert(path.into(), stat);
    }

    pub fn get(&self, path: &Path) -> Option<&EntryStat> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.keys()
    }

    /// Inode to path, for move detection. Inode 0 means unknown and is skipped.
    pub(crate) fn inode_index(&self) -> HashMap<u64, &PathBuf> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (path, stat) in &self.entries {
            if stat.inode != 0 {
                index
                    .entry(stat.inode)
                    .and_modify(|existing: &mut &PathBuf| {
                        // Hard links: keep a stable choice
                        if path < *existing {
                            *existing = path;
                        }
                    })
                    .or_insert(path);
            }
        }
        index
    }

    /// Drop directories with no file anywhere beneath them.
    ///
    /// Empty directories hold no comics, so tracking them only adds churn.
    pub fn retain_populated_dirs(&mut self) {
        let mut populated: HashSet<PathBuf> = HashSet::new();
        for (path, stat) in &self.entries {
            if stat.is_dir {
                continue;
            }
            for ancestor in path.ancestors().skip(1) {
                if !populated.insert(ancestor.to_path_buf()) {
                    break;
                }
            }
        }
        self.entries
            .retain(|path, stat| !stat.is_dir || populated.contains(path));
    }

    /// Snapshot the live filesystem under `root`.
    ///
    /// Every directory is included; files only when `include_file` accepts
    /// them. The root itself is not an entry. Unreadable entries are skipped.
    pub fn walk(root: &Path, include_file: impl Fn(&Path) -> bool) -> std::io::Result<Self> {
        // Fail loudly if the root itself is gone
        std::fs::metadata(root)?;

        let mut snapshot = Self::new();
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(target: "snapshot", error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let is_dir = entry.file_type().is_dir();
            if !is_dir && !include_file(entry.path()) {
                continue;
            }
            match entry.metadata() {
                Ok(md) => snapshot.insert(entry.path(), EntryStat::from_metadata(&md)),
                Err(e) => {
                    tracing::debug!(target: "snapshot", path = %entry.path().display(), error = %e, "Stat failed");
                }
            }
        }
        Ok(snapshot)
    }
}

/// Build a synthetic snapshot from a library's persisted entries.
///
/// Entries with a missing or malformed stat are re-verified: if the path
/// still exists its real inode is used with a zeroed mtime, so the diff
/// reports it modified; otherwise it keeps an unknown inode and the diff
/// reports it deleted. With `force_modify` every entry gets a zeroed
/// mtime, which turns every surviving path into a modification.
pub async fn from_database(pool: &SqlitePool, library_id: i64, force_modify: bool) -> Result<Snapshot> {
    let rows = db::get_watched_entries(pool, library_id).await?;

    let snapshot = tokio::task::spawn_blocking(move || {
        let mut snapshot = Snapshot::new();
        let mut reverified = 0usize;
        for row in rows {
            let path = PathBuf::from(&row.path);
            let entry = match StatTuple::parse(row.stat.as_deref()) {
                Some(stat) => {
                    let mut entry = EntryStat::from_stat(&stat);
                    entry.is_dir = row.is_dir;
                    if force_modify {
                        entry.mtime = 0.0;
                    }
                    entry
                }
                None => {
                    reverified += 1;
                    match std::fs::metadata(&path) {
                        Ok(md) => EntryStat {
                            mtime: 0.0,
                            is_dir: row.is_dir,
                            ..EntryStat::from_metadata(&md)
                        },
                        Err(_) => EntryStat {
                            inode: 0,
                            device: 0,
                            size: 0,
                            mtime: 0.0,
                            is_dir: row.is_dir,
                        },
                    }
                }
            };
            snapshot.insert(path, entry);
        }
        if reverified > 0 {
            tracing::debug!(target: "snapshot", library = library_id, reverified, "Entries without usable stat");
        }
        snapshot
    })
    .await
    .map_err(|e| crate::error::Error::channel(format!("snapshot task: {e}")))?;

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::is_comic_archive;
    use crate::test_utils::{temp_db, temp_library, write_comic};
    use std::fs;

    #[test]
    fn test_walk_includes_dirs_and_archives_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("Marvel")).unwrap();
        fs::write(root.join("Marvel/a.cbz"), b"PK\x03\x04").unwrap();
        fs::write(root.join("Marvel/notes.txt"), b"skip").unwrap();
        fs::write(root.join("b.CBR"), b"Rar!").unwrap();

        let snapshot = Snapshot::walk(root, is_comic_archive).unwrap();

        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.get(&root.join("Marvel")).unwrap().is_dir);
        assert!(!snapshot.get(&root.join("Marvel/a.cbz")).unwrap().is_dir);
        assert!(snapshot.contains(&root.join("b.CBR")));
        assert!(!snapshot.contains(&root.join("Marvel/notes.txt")));
        assert!(!snapshot.contains(root));
    }

    #[test]
    fn test_retain_populated_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("A/B")).unwrap();
        fs::create_dir_all(root.join("Empty/Deeper")).unwrap();
        fs::write(root.join("A/B/1.cbz"), b"PK\x03\x04").unwrap();

        let mut snapshot = Snapshot::walk(root, is_comic_archive).unwrap();
        snapshot.retain_populated_dirs();

        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.contains(&root.join("A")));
        assert!(!snapshot.contains(&root.join("Empty")));
    }

    #[test]
    fn test_walk_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Snapshot::walk(&dir.path().join("gone"), |_| true);
        assert!(result.is_err());
    }

    #[test]
    fn test_inode_index_skips_unknown() {
        let mut snapshot = Snapshot::new();
        let stat = |inode| EntryStat {
            inode,
            device: 0,
            size: 1,
            mtime: 1.0,
            is_dir: false,
        };
        snapshot.insert("/a", stat(0));
        snapshot.insert("/b", stat(7));
        let index = snapshot.inode_index();
        assert_eq!(index.len(), 1);
        assert_eq!(index[&7], &PathBuf::from("/b"));
    }

    async fn insert_entry(pool: &SqlitePool, library_id: i64, table: &str, path: &Path, stat: Option<&str>) {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let sql = if table == "folders" {
            "INSERT INTO folders (library_id, path, name, stat) VALUES (?, ?, ?, ?)"
        } else {
            "INSERT INTO failed_imports (library_id, path, name, stat, reason) VALUES (?, ?, ?, ?, 'Empty file')"
        };
        sqlx::query(sql)
            .bind(library_id)
            .bind(db::path_str(path))
            .bind(name)
            .bind(stat)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_stats_are_reverified_against_disk() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let present_dir = root.path().join("Present");
        let kept = write_comic(root.path(), "Present/kept.cbz");
        let gone_dir = root.path().join("Gone");
        let gone = root.path().join("Gone/gone.cbz");

        insert_entry(&pool, library_id, "folders", &present_dir, Some("[1, 2, 3]")).await;
        insert_entry(&pool, library_id, "failed_imports", &kept, None).await;
        insert_entry(&pool, library_id, "folders", &gone_dir, None).await;
        insert_entry(&pool, library_id, "failed_imports", &gone, Some("")).await;

        let reference = from_database(&pool, library_id, false).await.unwrap();
        assert_eq!(reference.len(), 4);
        assert_eq!(reference.get(&kept).unwrap().mtime, 0.0);
        assert!(reference.get(&present_dir).unwrap().is_dir);
        assert_eq!(reference.get(&gone).unwrap().inode, 0);
        assert_eq!(reference.get(&gone_dir).unwrap().inode, 0);

        let live = Snapshot::walk(root.path(), is_comic_archive).unwrap();
        let d = diff(&reference, &live, true);
        assert_eq!(d.files.modified, [kept].into());
        assert_eq!(d.files.deleted, [gone].into());
        assert_eq!(d.dirs.modified, [present_dir].into());
        assert_eq!(d.dirs.deleted, [gone_dir].into());
        assert!(d.files.created.is_empty() && d.dirs.created.is_empty());
        assert!(d.files.moved.is_empty() && d.dirs.moved.is_empty());
    }

    #[tokio::test]
    async fn test_force_modify_zeroes_every_mtime() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        let path = write_comic(root.path(), "a.cbz");
        let stat = StatTuple::from_path(&path).unwrap().to_json();
        insert_entry(&pool, library_id, "failed_imports", &path, Some(stat.as_str())).await;

        let plain = from_database(&pool, library_id, false).await.unwrap();
        assert!(plain.get(&path).unwrap().mtime > 0.0);
        let forced = from_database(&pool, library_id, true).await.unwrap();
        assert_eq!(forced.get(&path).unwrap().mtime, 0.0);
        assert_eq!(forced.get(&path).unwrap().inode, plain.get(&path).unwrap().inode);
    }
}
