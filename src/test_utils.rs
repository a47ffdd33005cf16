//! Test utilities and fixtures for comic-minder tests.
//!
//! This module provides a throwaway database, a throwaway library root,
//! fake archives and a scripted [`MetadataDecoder`] to reduce boilerplate
//! in tests.
//!
//! # Example
//!
//! ```ignore
//! use comic_minder::test_utils::{temp_db, temp_library, write_comic};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let (pool, _dir) = temp_db().await;
//!     let (library_id, root) = temp_library(&pool).await;
//!     let path = write_comic(root.path(), "Saga/Saga 001.cbz");
//!     // ... test logic
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

use crate::metadata::{ComicMetadata, DecodeError, MetadataDecoder};

/// Creates a temporary database for testing.
///
/// The database is created in a temporary directory that is automatically
/// cleaned up when the returned `TempDir` is dropped. Migrations are run
/// automatically.
///
/// # Returns
///
/// A tuple of (connection pool, temp directory handle).
/// Keep the TempDir alive for the duration of your test.
pub async fn temp_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = dir.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());

    let pool = crate::db::init_db(&db_url)
        .await
        .expect("Failed to initialize test database");

    (pool, dir)
}

/// Registers a fresh temporary directory as a library.
///
/// # Returns
///
/// The library id and the root directory handle.
pub async fn temp_library(pool: &SqlitePool) -> (i64, TempDir) {
    let root = tempfile::tempdir().expect("Failed to create library root");
    let id = crate::db::add_library(pool, root.path(), 3600)
        .await
        .expect("Failed to add library");
    (id, root)
}

/// Writes a small file with a zip signature at `root/relative`.
///
/// Parent directories are created as needed. Returns the absolute path.
pub fn write_comic(root: &Path, relative: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create comic directory");
    }
    std::fs::write(&path, b"PK\x03\x04 comic-minder test archive").expect("Failed to write comic");
    path
}

/// A decoder that answers from a fixed table.
///
/// Paths without an entry fail as malformed. Entries can be changed while
/// the decoder is shared, to simulate a file being fixed on disk.
#[derive(Debug, Default)]
pub struct StaticDecoder {
    entries: RwLock<HashMap<PathBuf, Option<ComicMetadata>>>,
}

impl StaticDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `path` to `meta`.
    pub fn with(self, path: impl Into<PathBuf>, meta: ComicMetadata) -> Self {
        self.set(path, meta);
        self
    }

    /// Fail to decode `path`.
    pub fn failing(self, path: impl Into<PathBuf>) -> Self {
        self.entries.write().insert(path.into(), None);
        self
    }

    /// Replace the entry for `path`.
    pub fn set(&self, path: impl Into<PathBuf>, meta: ComicMetadata) {
        self.entries.write().insert(path.into(), Some(meta));
    }
}

impl MetadataDecoder for StaticDecoder {
    fn decode(&self, path: &Path) -> Result<ComicMetadata, DecodeError> {
        match self.entries.read().get(path) {
            Some(Some(meta)) => Ok(meta.clone()),
            Some(None) => Err(DecodeError::Malformed("scripted failure".into())),
            None => Err(DecodeError::Malformed("no fixture for path".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temp_db_creates_working_database() {
        let (pool, _dir) = temp_db().await;

        // Should be able to query
        let libraries = crate::db::get_libraries(&pool).await.unwrap();
        assert!(libraries.is_empty());
    }

    #[tokio::test]
    async fn test_temp_library_registers_root() {
        let (pool, _dir) = temp_db().await;
        let (id, root) = temp_library(&pool).await;

        let library = crate::db::get_library(&pool, id).await.unwrap();
        assert_eq!(Path::new(&library.path), root.path().canonicalize().unwrap());
    }

    #[test]
    fn test_static_decoder_entries() {
        let decoder = StaticDecoder::new()
            .with("/lib/a.cbz", ComicMetadata::default())
            .failing("/lib/b.cbz");

        assert!(decoder.decode(Path::new("/lib/a.cbz")).is_ok());
        assert!(decoder.decode(Path::new("/lib/b.cbz")).is_err());
        assert!(decoder.decode(Path::new("/lib/c.cbz")).is_err());

        decoder.set("/lib/b.cbz", ComicMetadata::default());
        assert!(decoder.decode(Path::new("/lib/b.cbz")).is_ok());
    }
}
