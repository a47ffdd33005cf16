//! Compact filesystem stat snapshot stored on every watched entry.
//!
//! Persisted as a fixed-width JSON array laid out like a POSIX stat result:
//! `[mode, inode, dev, nlink, uid, gid, size, atime, mtime, ctime]`.
//! Only mode, inode, size and mtime are kept; the rest are written as zero.
//! The device number in particular is never stored because it changes when
//! a volume is remounted, and a remount must not look like a deletion.

use std::fs::Metadata;
use std::time::UNIX_EPOCH;

type StatArray = (u32, u64, u64, u64, u64, u64, u64, u64, f64, u64);

/// Mode bits used when the platform gives us none.
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// The stat fields the sync engine compares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatTuple {
    pub mode: u32,
    pub inode: u64,
    pub size: u64,
    pub mtime: f64,
}

impl StatTuple {
    /// Capture the comparable fields of a file's metadata.
    pub fn from_metadata(md: &Metadata) -> Self {
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            mode: mode_of(md),
            inode: inode_of(md),
            size: if md.is_dir() { 0 } else { md.len() },
            mtime,
        }
    }

    /// Stat a path, following symlinks.
    pub fn from_path(path: &std::path::Path) -> std::io::Result<Self> {
        std::fs::metadata(path).map(|md| Self::from_metadata(&md))
    }

    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == S_IFDIR
    }

    /// Serialise to the persisted fixed-width layout.
    pub fn to_json(&self) -> String {
        let array: StatArray = (self.mode, self.inode, 0, 0, 0, 0, self.size, 0, self.mtime, 0);
        // Tuples of plain numbers always serialise.
        serde_json::to_string(&array).unwrap_or_default()
    }

    /// Parse a persisted stat column.
    ///
    /// Returns `None` when the column is missing, empty, the wrong width,
    /// or carries no mtime; such entries need re-verification against disk.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        let array: StatArray = serde_json::from_str(raw).ok()?;
        let stat = Self {
            mode: array.0,
            inode: array.1,
            size: array.6,
            mtime: array.8,
        };
        (stat.mtime > 0.0).then_some(stat)
    }
}

#[cfg(unix)]
fn mode_of(md: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
fn mode_of(md: &Metadata) -> u32 {
    if md.is_dir() { S_IFDIR } else { S_IFREG }
}

#[cfg(unix)]
fn inode_of(md: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.ino()
}

#[cfg(not(unix))]
fn inode_of(_md: &Metadata) -> u64 {
    0
}
