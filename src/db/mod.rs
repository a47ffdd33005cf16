//! Database module for libraries, watched entries and their relations.
//!
//! Uses SQLx with SQLite for lightweight, embedded database storage.
//! The sync engine's bulk reads and writes live in [`crate::importer`];
//! this module holds pool setup, the library registry, the per-library
//! in-progress flag and the read-side queries used by the CLI.
//!
//! # Example
//!
//! ```ignore
//! use comic_minder::db::{init_db, get_libraries};
//!
//! let pool = init_db("sqlite:comics.db").await?;
//! let libraries = get_libraries(&pool).await?;
//! ```

use std::path::Path;

use chrono::Utc;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result, ResultExt};
use crate::model::{Comic, FailedImport, Library};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "comic_minder.db";

/// Build a SQLite database URL from an optional path.
///
/// If no path is provided, uses [`DEFAULT_DB_NAME`] in the current directory.
pub fn db_url(path: Option<&Path>) -> String {
    match path {
        Some(p) => format!("sqlite:{}", p.display()),
        None => format!("sqlite:{}", DEFAULT_DB_NAME),
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist, establishes a connection
/// pool with up to 5 connections, and runs all pending migrations. SQLx
/// enables foreign keys on every connection, which the folder-delete
/// cascade relies on.
///
/// # Errors
///
/// Returns an error if:
/// - Database creation fails
/// - Connection cannot be established
/// - Migration fails
pub async fn init_db(db_url: &str) -> Result<SqlitePool> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Current time in the format stored in `*_at` columns.
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Paths are stored as lossy UTF-8 strings.
pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Library registry
// ============================================================================

const LIBRARY_COLUMNS: &str =
    "id, path, events, poll, poll_every_secs, last_poll, update_in_progress";

/// Register a new library root.
///
/// The path is canonicalised so that watcher events, which always carry
/// absolute paths, match the stored root.
pub async fn add_library(pool: &SqlitePool, root: &Path, poll_every_secs: u64) -> Result<i64> {
    let root = root
        .canonicalize()
        .with_context(format!("Cannot open library root {}", root.display()))?;
    if !root.is_dir() {
        return Err(Error::NotADirectory(root));
    }

    let row: (i64,) = sqlx::query_as(
        "INSERT INTO libraries (path, poll_every_secs) VALUES (?, ?) RETURNING id",
    )
    .bind(path_str(&root))
    .bind(poll_every_secs as i64)
    .fetch_one(pool)
    .await?;

    tracing::info!(target: "db", library = row.0, path = %root.display(), "Library added");
    Ok(row.0)
}

/// Get a library by id.
pub async fn get_library(pool: &SqlitePool, id: i64) -> Result<Library> {
    sqlx::query_as::<_, Library>(&format!(
        "SELECT {LIBRARY_COLUMNS} FROM libraries WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(Error::LibraryNotFound(id))
}

/// Get all libraries, ordered by id.
pub async fn get_libraries(pool: &SqlitePool) -> sqlx::Result<Vec<Library>> {
    sqlx::query_as::<_, Library>(&format!(
        "SELECT {LIBRARY_COLUMNS} FROM libraries ORDER BY id"
    ))
    .fetch_all(pool)
    .await
}

/// Remove a library and, through cascades, everything under it.
///
/// Returns false if no such library existed.
pub async fn remove_library(pool: &SqlitePool, id: i64) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM libraries WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Change how a library is watched.
pub async fn update_library_settings(
    pool: &SqlitePool,
    id: i64,
    events: bool,
    poll: bool,
    poll_every_secs: u64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE libraries SET events = ?, poll = ?, poll_every_secs = ?, updated_at = ? WHERE id = ?",
    )
    .bind(events)
    .bind(poll)
    .bind(poll_every_secs as i64)
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::LibraryNotFound(id));
    }
    Ok(())
}

/// Record that a library was just polled.
pub async fn touch_last_poll(pool: &SqlitePool, id: i64) -> sqlx::Result<()> {
    sqlx::query("UPDATE libraries SET last_poll = ? WHERE id = ?")
        .bind(now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// In-progress flag
// ============================================================================

/// Atomically claim a library for a sync task.
///
/// Returns false when another task already holds the flag.
pub async fn try_begin_update(pool: &SqlitePool, id: i64) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE libraries SET update_in_progress = 1 WHERE id = ? AND update_in_progress = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Release a library claimed with [`try_begin_update`].
pub async fn end_update(pool: &SqlitePool, id: i64) -> sqlx::Result<()> {
    sqlx::query("UPDATE libraries SET update_in_progress = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear flags left behind by a process that died mid-sync.
pub async fn clear_stale_updates(pool: &SqlitePool) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE libraries SET update_in_progress = 0 WHERE update_in_progress = 1")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Watched entries
// ============================================================================

/// Path and raw stat of any watched entry in a library.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchedEntryRow {
    pub path: String,
    pub stat: Option<String>,
    pub is_dir: bool,
}

/// Load every folder, comic and failed import of a library.
pub async fn get_watched_entries(
    pool: &SqlitePool,
    library_id: i64,
) -> sqlx::Result<Vec<WatchedEntryRow>> {
    sqlx::query_as::<_, WatchedEntryRow>(
        r#"
        SELECT path, stat, 1 AS is_dir FROM folders WHERE library_id = ?1
        UNION ALL
        SELECT path, stat, 0 AS is_dir FROM comics WHERE library_id = ?1
        UNION ALL
        SELECT path, stat, 0 AS is_dir FROM failed_imports WHERE library_id = ?1
        "#,
    )
    .bind(library_id)
    .fetch_all(pool)
    .await
}

// ============================================================================
// Read-side queries
// ============================================================================

const COMIC_COLUMNS: &str = "id, library_id, path, name, parent_folder_id, stat, \
    publisher_id, imprint_id, series_id, volume_id, variant_of_id, title, issue_number, issue_suffix, \
    year, month, day, summary, age_rating, language, page_count, file_type, size";

/// Get all comics, optionally restricted to one library.
pub async fn get_comics(pool: &SqlitePool, library_id: Option<i64>) -> sqlx::Result<Vec<Comic>> {
    sqlx::query_as::<_, Comic>(&format!(
        "SELECT {COMIC_COLUMNS} FROM comics WHERE ?1 IS NULL OR library_id = ?1 ORDER BY path"
    ))
    .bind(library_id)
    .fetch_all(pool)
    .await
}

/// Get a comic by path.
pub async fn get_comic_by_path(
    pool: &SqlitePool,
    library_id: i64,
    path: &Path,
) -> sqlx::Result<Option<Comic>> {
    sqlx::query_as::<_, Comic>(&format!(
        "SELECT {COMIC_COLUMNS} FROM comics WHERE library_id = ? AND path = ?"
    ))
    .bind(library_id)
    .bind(path_str(path))
    .fetch_optional(pool)
    .await
}

/// Get failed imports, optionally restricted to one library.
pub async fn get_failed_imports(
    pool: &SqlitePool,
    library_id: Option<i64>,
) -> sqlx::Result<Vec<FailedImport>> {
    sqlx::query_as::<_, FailedImport>(
        r#"
        SELECT id, library_id, path, name, parent_folder_id, stat, reason, updated_at
        FROM failed_imports
        WHERE ?1 IS NULL OR library_id = ?1
        ORDER BY path
        "#,
    )
    .bind(library_id)
    .fetch_all(pool)
    .await
}

/// Dismiss a failed import. It comes back only if the path fails again.
pub async fn dismiss_failed_import(pool: &SqlitePool, id: i64) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM failed_imports WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Row counts for a quick overview.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub folders: i64,
    pub comics: i64,
    pub failed_imports: i64,
    pub publishers: i64,
    pub imprints: i64,
    pub series: i64,
    pub volumes: i64,
}

/// Count the main tables.
pub async fn table_counts(pool: &SqlitePool) -> sqlx::Result<TableCounts> {
    let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM folders),
            (SELECT COUNT(*) FROM comics),
            (SELECT COUNT(*) FROM failed_imports),
            (SELECT COUNT(*) FROM publishers),
            (SELECT COUNT(*) FROM imprints),
            (SELECT COUNT(*) FROM series),
            (SELECT COUNT(*) FROM volumes)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(TableCounts {
        folders: row.0,
        comics: row.1,
        failed_imports: row.2,
        publishers: row.3,
        imprints: row.4,
        series: row.5,
        volumes: row.6,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_db;

    #[tokio::test]
    async fn test_init_db_creates_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db_url = format!("sqlite:{}", db_path.display());

        let pool = init_db(&db_url).await.expect("Failed to init db");
        assert!(db_path.exists());

        let libraries = get_libraries(&pool).await.expect("Failed to query libraries");
        assert!(libraries.is_empty());
    }

    #[tokio::test]
    async fn test_missing_library_root_is_refused() {
        let (pool, _dir) = temp_db().await;
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("not-here");

        let err = add_library(&pool, &missing, 900).await.unwrap_err();
        assert!(err.to_string().contains("Cannot open library root"));
        assert!(get_libraries(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_library_registry() {
        let (pool, _dir) = temp_db().await;
        let root = tempfile::tempdir().unwrap();

        let id = add_library(&pool, root.path(), 900).await.unwrap();
        let library = get_library(&pool, id).await.unwrap();
        assert_eq!(library.poll_every_secs, 900);
        assert!(library.events);
        assert!(library.poll);
        assert!(!library.update_in_progress);

        update_library_settings(&pool, id, false, true, 120).await.unwrap();
        let library = get_library(&pool, id).await.unwrap();
        assert!(!library.events);
        assert_eq!(library.poll_every_secs, 120);

        assert!(remove_library(&pool, id).await.unwrap());
        assert!(matches!(
            get_library(&pool, id).await,
            Err(Error::LibraryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_library_rejects_files() {
        let (pool, dir) = temp_db().await;
        let file = dir.path().join("not-a-dir.cbz");
        std::fs::write(&file, b"x").unwrap();

        let result = add_library(&pool, &file, 60).await;
        assert!(matches!(result, Err(Error::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_in_progress_flag_is_exclusive() {
        let (pool, _dir) = temp_db().await;
        let root = tempfile::tempdir().unwrap();
        let id = add_library(&pool, root.path(), 60).await.unwrap();

        assert!(try_begin_update(&pool, id).await.unwrap());
        assert!(!try_begin_update(&pool, id).await.unwrap());

        end_update(&pool, id).await.unwrap();
        assert!(try_begin_update(&pool, id).await.unwrap());

        assert_eq!(clear_stale_updates(&pool).await.unwrap(), 1);
        assert!(!get_library(&pool, id).await.unwrap().update_in_progress);
    }
}
