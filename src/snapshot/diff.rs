//! Snapshot comparison.
//!
//! Compares a reference snapshot (usually built from the database) with a
//! candidate (usually the live filesystem) and classifies every change into
//! eight disjoint sets: directories and files, each created, deleted,
//! modified or moved.
//!
//! Identity is the inode alone. A path whose inode changed was replaced in
//! place and is reported as a delete plus a create (or as a modification in
//! inode-only mode). Moves are found by matching inodes between the deleted
//! and created sets.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::Snapshot;

/// Changes of one entry kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
    pub modified: BTreeSet<PathBuf>,
    /// Source path to destination path
    pub moved: BTreeMap<PathBuf, PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.deleted.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
    }

    /// Number of batched operations.
    pub fn len(&self) -> usize {
        self.created.len() + self.deleted.len() + self.modified.len() + self.moved.len()
    }
}

/// The full diff of a library: directories and files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub dirs: ChangeSet,
    pub files: ChangeSet,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dirs.len() + self.files.len()
    }

    fn set_mut(&mut self, is_dir: bool) -> &mut ChangeSet {
        if is_dir { &mut self.dirs } else { &mut self.files }
    }
}

/// Compute the changes that turn `reference` into `candidate`.
pub fn diff(reference: &Snapshot, candidate: &Snapshot, inode_only: bool) -> SnapshotDiff {
    let mut created: BTreeSet<PathBuf> = candidate
        .paths()
        .filter(|p| !reference.contains(p))
        .cloned()
        .collect();
    let mut deleted: BTreeSet<PathBuf> = reference
        .paths()
        .filter(|p| !candidate.contains(p))
        .cloned()
        .collect();
    let mut modified = BTreeSet::new();

    // Paths replaced in place
    for path in reference.paths() {
        let (Some(old), Some(new)) = (reference.get(path), candidate.get(path)) else {
            continue;
        };
        if old.inode != new.inode {
            if inode_only {
                modified.insert(path.clone());
            } else {
                created.insert(path.clone());
                deleted.insert(path.clone());
            }
        }
    }

    // Pair deletions with creations of the same inode
    let candidate_inodes = candidate.inode_index();
    let mut moved = BTreeMap::new();
    for src in deleted.clone() {
        let Some(old) = reference.get(&src) else {
            continue;
        };
        if old.inode == 0 {
            continue;
        }
        let Some(&dest) = candidate_inodes.get(&old.inode) else {
            continue;
        };
        let same_kind = candidate.get(dest).is_some_and(|new| new.is_dir == old.is_dir);
        if *dest != src && same_kind && created.remove(dest) {
            deleted.remove(&src);
            moved.insert(src, dest.clone());
        }
    }
    // A move onto a replaced path supersedes the delete of the old occupant
    for dest in moved.values() {
        deleted.remove(dest);
    }

    // Content changes on stationary paths
    let move_dests: BTreeSet<&PathBuf> = moved.values().collect();
    for path in reference.paths() {
        if created.contains(path)
            || deleted.contains(path)
            || moved.contains_key(path)
            || move_dests.contains(path)
        {
            continue;
        }
        let (Some(old), Some(new)) = (reference.get(path), candidate.get(path)) else {
            continue;
        };
        if old.mtime != new.mtime || old.size != new.size {
            modified.insert(path.clone());
        }
    }
    // ...and on move destinations
    for (src, dest) in &moved {
        let (Some(old), Some(new)) = (reference.get(src), candidate.get(dest)) else {
            continue;
        };
        if old.mtime != new.mtime || old.size != new.size {
            modified.insert(dest.clone());
        }
    }

    let mut result = SnapshotDiff::default();
    for path in created {
        let is_dir = candidate.get(&path).is_some_and(|s| s.is_dir);
        result.set_mut(is_dir).created.insert(path);
    }
    for path in deleted {
        let is_dir = reference.get(&path).is_some_and(|s| s.is_dir);
        result.set_mut(is_dir).deleted.insert(path);
    }
    for path in modified {
        let is_dir = candidate
            .get(&path)
            .or_else(|| reference.get(&path))
            .is_some_and(|s| s.is_dir);
        result.set_mut(is_dir).modified.insert(path);
    }
    for (src, dest) in moved {
        let is_dir = candidate.get(&dest).is_some_and(|s| s.is_dir);
        result.set_mut(is_dir).moved.insert(src, dest);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EntryStat;

    fn file(inode: u64, size: u64, mtime: f64) -> EntryStat {
        EntryStat {
            inode,
            device: 1,
            size,
            mtime,
            is_dir: false,
        }
    }

    fn dir(inode: u64, mtime: f64) -> EntryStat {
        EntryStat {
            inode,
            device: 1,
            size: 0,
            mtime,
            is_dir: true,
        }
    }

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_created_deleted_modified() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a.cbz", file(1, 10, 1.0));
        reference.insert("/lib/b.cbz", file(2, 10, 1.0));
        reference.insert("/lib/c.cbz", file(3, 10, 1.0));

        let mut candidate = Snapshot::new();
        candidate.insert("/lib/a.cbz", file(1, 10, 1.0));
        candidate.insert("/lib/b.cbz", file(2, 20, 2.0));
        candidate.insert("/lib/d.cbz", file(4, 10, 1.0));

        let d = diff(&reference, &candidate, false);
        assert_eq!(d.files.created, BTreeSet::from([p("/lib/d.cbz")]));
        assert_eq!(d.files.deleted, BTreeSet::from([p("/lib/c.cbz")]));
        assert_eq!(d.files.modified, BTreeSet::from([p("/lib/b.cbz")]));
        assert!(d.files.moved.is_empty());
        assert!(d.dirs.is_empty());
    }

    #[test]
    fn test_device_change_is_not_a_change() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a.cbz", file(1, 10, 1.0));
        let mut candidate = Snapshot::new();
        candidate.insert("/lib/a.cbz", EntryStat { device: 99, ..file(1, 10, 1.0) });

        assert!(diff(&reference, &candidate, false).is_empty());
    }

    #[test]
    fn test_rename_is_a_move() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/old", dir(10, 1.0));
        reference.insert("/lib/old/a.cbz", file(1, 10, 1.0));

        let mut candidate = Snapshot::new();
        candidate.insert("/lib/new", dir(10, 1.0));
        candidate.insert("/lib/new/a.cbz", file(1, 10, 1.0));

        let d = diff(&reference, &candidate, false);
        assert_eq!(d.dirs.moved.get(&p("/lib/old")), Some(&p("/lib/new")));
        assert_eq!(
            d.files.moved.get(&p("/lib/old/a.cbz")),
            Some(&p("/lib/new/a.cbz"))
        );
        assert!(d.dirs.created.is_empty() && d.dirs.deleted.is_empty());
        assert!(d.files.created.is_empty() && d.files.deleted.is_empty());
        assert!(d.files.modified.is_empty());
    }

    #[test]
    fn test_moved_and_changed_marks_destination_modified() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a.cbz", file(1, 10, 1.0));
        let mut candidate = Snapshot::new();
        candidate.insert("/lib/b.cbz", file(1, 11, 2.0));

        let d = diff(&reference, &candidate, false);
        assert_eq!(d.files.moved.get(&p("/lib/a.cbz")), Some(&p("/lib/b.cbz")));
        assert_eq!(d.files.modified, BTreeSet::from([p("/lib/b.cbz")]));
    }

    #[test]
    fn test_replaced_in_place() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a.cbz", file(1, 10, 1.0));
        let mut candidate = Snapshot::new();
        candidate.insert("/lib/a.cbz", file(2, 10, 1.0));

        let d = diff(&reference, &candidate, false);
        assert_eq!(d.files.created, BTreeSet::from([p("/lib/a.cbz")]));
        assert_eq!(d.files.deleted, BTreeSet::from([p("/lib/a.cbz")]));

        let d = diff(&reference, &candidate, true);
        assert!(d.files.created.is_empty());
        assert_eq!(d.files.modified, BTreeSet::from([p("/lib/a.cbz")]));
    }

    #[test]
    fn test_move_over_existing_file() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a.cbz", file(1, 10, 1.0));
        reference.insert("/lib/b.cbz", file(2, 10, 1.0));
        let mut candidate = Snapshot::new();
        candidate.insert("/lib/b.cbz", file(1, 10, 1.0));

        let d = diff(&reference, &candidate, false);
        assert_eq!(d.files.moved.get(&p("/lib/a.cbz")), Some(&p("/lib/b.cbz")));
        assert!(d.files.deleted.is_empty());
        assert!(d.files.created.is_empty());
    }

    #[test]
    fn test_unknown_inode_never_pairs() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a.cbz", file(0, 10, 1.0));
        let mut candidate = Snapshot::new();
        candidate.insert("/lib/b.cbz", file(0, 10, 1.0));

        let d = diff(&reference, &candidate, false);
        assert!(d.files.moved.is_empty());
        assert_eq!(d.files.deleted.len(), 1);
        assert_eq!(d.files.created.len(), 1);
    }

    #[test]
    fn test_file_and_dir_never_pair() {
        let mut reference = Snapshot::new();
        reference.insert("/lib/a", dir(5, 1.0));
        let mut candidate = Snapshot::new();
        candidate.insert("/lib/b.cbz", file(5, 1, 1.0));

        let d = diff(&reference, &candidate, false);
        assert!(d.dirs.moved.is_empty() && d.files.moved.is_empty());
        assert_eq!(d.dirs.deleted.len(), 1);
        assert_eq!(d.files.created.len(), 1);
    }
}

/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::snapshot::EntryStat;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// A small namespace so that paths and inodes collide often.
    fn snapshot_strategy() -> impl Strategy<Value = Snapshot> {
        prop::collection::btree_map(0u8..12, (1u64..10, 0u64..3, 0u8..3), 0..10).prop_map(
            |entries| {
                let mut snapshot = Snapshot::new();
                let mut used_inodes = HashSet::new();
                for (name, (inode, size, mtime)) in entries {
                    // Inodes are unique within one snapshot
                    if !used_inodes.insert(inode) {
                        continue;
                    }
                    snapshot.insert(
                        format!("/lib/{name}.cbz"),
                        EntryStat {
                            inode,
                            device: 0,
                            size,
                            mtime: mtime as f64,
                            is_dir: false,
                        },
                    );
                }
                snapshot
            },
        )
    }

    proptest! {
        /// Applying the diff to the reference paths yields the candidate paths
        #[test]
        fn diff_reconstructs_candidate(
            reference in snapshot_strategy(),
            candidate in snapshot_strategy(),
        ) {
            let d = diff(&reference, &candidate, false);
            let mut paths: BTreeSet<PathBuf> = reference.paths().cloned().collect();
            for path in &d.files.deleted {
                paths.remove(path);
            }
            for src in d.files.moved.keys() {
                paths.remove(src);
            }
            paths.extend(d.files.created.iter().cloned());
            paths.extend(d.files.moved.values().cloned());

            let expected: BTreeSet<PathBuf> = candidate.paths().cloned().collect();
            prop_assert_eq!(paths, expected);
        }

        /// Move sources and destinations never appear in created or deleted
        #[test]
        fn moves_are_disjoint(
            reference in snapshot_strategy(),
            candidate in snapshot_strategy(),
        ) {
            let d = diff(&reference, &candidate, false);
            for (src, dest) in &d.files.moved {
                prop_assert!(!d.files.deleted.contains(src));
                prop_assert!(!d.files.created.contains(dest));
                prop_assert!(!d.files.deleted.contains(dest));
            }
        }

        /// A snapshot never differs from itself
        #[test]
        fn self_diff_is_empty(snapshot in snapshot_strategy()) {
            prop_assert!(diff(&snapshot, &snapshot, false).is_empty());
        }
    }
}
