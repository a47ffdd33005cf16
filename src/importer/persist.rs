//! Persistence phases.
//!
//! Each phase runs in its own transaction and returns how many rows it
//! changed, so the importer can tell a no-op batch from a real one.
//! Phases run in a fixed order: folder moves, comic moves, folder stat
//! refresh, comic upserts, failed imports, relations, folder-ancestor
//! links, folder deletes, comic deletes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{MAIN_SEPARATOR_STR, Path, PathBuf};

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::aggregate::{ComicRecord, FailedRecord, RelationLists, ancestors};
use super::batches;
use super::foreign_keys::{ResolvedKeys, ensure_folders, lookup_folders};
use crate::db::path_str;
use crate::error::Result;
use crate::model::{GroupLevel, NamedKind, StatTuple};

/// Library, root and predicate cap shared by every phase.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub library_id: i64,
    pub root: &'a Path,
    pub cap: usize,
}

/// Comics whose path changed: id, old path, new path.
#[derive(Debug, Default)]
pub struct Moved {
    pub changed: u64,
    pub comics: Vec<(i64, PathBuf, PathBuf)>,
}

/// Comics removed by a phase.
#[derive(Debug, Default)]
pub struct Removed {
    pub changed: u64,
    pub comics: Vec<(i64, PathBuf)>,
}

/// Comics written by the upsert phase.
#[derive(Debug, Default)]
pub struct Upserted {
    pub changed: u64,
    /// Path to id, for every record whose row was inserted or changed
    pub written: BTreeMap<PathBuf, i64>,
    /// Failed imports replaced by a successful decode
    pub cleared_failed: u64,
}

const TIMESTAMP: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// `dir` plus a trailing separator, for descendant matching.
pub fn prefix_of(dir: &Path) -> String {
    let mut prefix = path_str(dir);
    if !prefix.ends_with(MAIN_SEPARATOR_STR) {
        prefix.push_str(MAIN_SEPARATOR_STR);
    }
    prefix
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn stat_json(path: &Path) -> Option<String> {
    StatTuple::from_path(path).ok().map(|s| s.to_json())
}

/// Rewrite `path` through moves already applied.
pub(crate) fn rebase(path: &Path, applied: &[(PathBuf, PathBuf)]) -> PathBuf {
    let mut current = path.to_path_buf();
    for (src, dest) in applied {
        if let Ok(rest) = current.strip_prefix(src) {
            current = if rest.as_os_str().is_empty() {
                dest.clone()
            } else {
                dest.join(rest)
            };
        }
    }
    current
}

async fn folder_id(conn: &mut SqliteConnection, library_id: i64, path: &Path) -> Result<Option<i64>> {
    Ok(sqlx::query_scalar("SELECT id FROM folders WHERE library_id = ? AND path = ?")
        .bind(library_id)
        .bind(path_str(path))
        .fetch_optional(&mut *conn)
        .await?)
}

/// Parent folder id for an entry; None directly under the root.
async fn parent_folder(conn: &mut SqliteConnection, scope: Scope<'_>, path: &Path) -> Result<Option<i64>> {
    match path.parent() {
        Some(parent) if parent != scope.root => folder_id(conn, scope.library_id, parent).await,
        _ => Ok(None),
    }
}

/// Which of `paths` are stored in `table` for this library.
pub async fn existing_paths(
    pool: &SqlitePool,
    scope: Scope<'_>,
    table: &str,
    paths: &BTreeSet<PathBuf>,
) -> Result<BTreeSet<PathBuf>> {
    let paths: Vec<String> = paths.iter().map(|p| path_str(p)).collect();
    let mut found = BTreeSet::new();
    for chunk in batches(&paths, scope.cap, 1, 1) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT path FROM {table} WHERE library_id = "));
        qb.push_bind(scope.library_id);
        qb.push(" AND path IN (");
        let mut sep = qb.separated(", ");
        for path in chunk {
            sep.push_bind(path.clone());
        }
        sep.push_unseparated(")");
        let rows: Vec<(String,)> = qb.build_query_as().fetch_all(pool).await?;
        found.extend(rows.into_iter().map(|(p,)| PathBuf::from(p)));
    }
    Ok(found)
}

/// Delete every row of `table` at `path` or beneath it.
async fn delete_subtree(conn: &mut SqliteConnection, library_id: i64, table: &str, path: &Path) -> Result<u64> {
    let sql = format!(
        "DELETE FROM {table} WHERE library_id = ?1 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3)"
    );
    Ok(sqlx::query(&sql)
        .bind(library_id)
        .bind(path_str(path))
        .bind(prefix_of(path))
        .execute(&mut *conn)
        .await?
        .rows_affected())
}

/// Comics at `path` or beneath it.
async fn comics_under(conn: &mut SqliteConnection, library_id: i64, path: &Path) -> Result<Vec<(i64, PathBuf)>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, path FROM comics WHERE library_id = ?1 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3)",
    )
    .bind(library_id)
    .bind(path_str(path))
    .bind(prefix_of(path))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(id, p)| (id, PathBuf::from(p))).collect())
}

// ============================================================================
// Moves
// ============================================================================

/// Apply directory moves, parents first, rewriting every descendant path.
///
/// Ids are preserved. Rows already sitting at a destination are replaced.
/// A move whose source row is unknown is skipped.
pub async fn move_folders(
    pool: &SqlitePool,
    scope: Scope<'_>,
    moves: &BTreeMap<PathBuf, PathBuf>,
) -> Result<(Moved, Vec<(PathBuf, PathBuf)>)> {
    let mut ordered: Vec<(&PathBuf, &PathBuf)> = moves.iter().collect();
    ordered.sort_by_key(|(src, _)| src.components().count());

    let mut moved = Moved::default();
    let mut applied: Vec<(PathBuf, PathBuf)> = Vec::new();

    for (src, dest) in ordered {
        let src = rebase(src, &applied);
        if src == *dest {
            continue;
        }

        let mut tx = pool.begin().await?;
        let Some(id) = folder_id(&mut tx, scope.library_id, &src).await? else {
            tracing::debug!(target: "importer::persist", src = %src.display(), "Moved folder not stored, skipping");
            continue;
        };

        let under = comics_under(&mut tx, scope.library_id, &src).await?;

        for table in ["comics", "failed_imports", "folders"] {
            moved.changed += delete_subtree(&mut tx, scope.library_id, table, dest).await?;
        }

        let dest_ancestors: BTreeSet<PathBuf> = ancestors(scope.root, dest).into_iter().collect();
        moved.changed += ensure_folders(&mut tx, scope.library_id, &dest_ancestors, scope.cap).await?;
        let parent_id = parent_folder(&mut tx, scope, dest).await?;

        moved.changed += sqlx::query(
            "UPDATE folders SET path = ?, name = ?, parent_folder_id = ?, stat = ?, updated_at = ? WHERE id = ?",
        )
        .bind(path_str(dest))
        .bind(file_name(dest))
        .bind(parent_id)
        .bind(stat_json(dest))
        .bind(crate::db::now())
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let (old_prefix, new_prefix) = (prefix_of(&src), prefix_of(dest));
        for table in ["folders", "comics", "failed_imports"] {
            let sql = format!(
                "UPDATE {table} SET path = ?1 || substr(path, length(?2) + 1) \
                 WHERE library_id = ?3 AND substr(path, 1, length(?2)) = ?2"
            );
            moved.changed += sqlx::query(&sql)
                .bind(&new_prefix)
                .bind(&old_prefix)
                .bind(scope.library_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        for (comic_id, old) in under {
            let new = rebase(&old, &[(src.clone(), dest.clone())]);
            moved.comics.push((comic_id, old, new));
        }
        tracing::debug!(target: "importer::persist", src = %src.display(), dest = %dest.display(), "Folder moved");
        applied.push((src, dest.clone()));
    }

    Ok((moved, applied))
}

/// Apply file moves after folder moves, keeping comic ids.
///
/// Failed imports move along with their path.
pub async fn move_comics(
    pool: &SqlitePool,
    scope: Scope<'_>,
    moves: &BTreeMap<PathBuf, PathBuf>,
    folder_moves: &[(PathBuf, PathBuf)],
) -> Result<Moved> {
    let mut moved = Moved::default();
    if moves.is_empty() {
        return Ok(moved);
    }

    let mut tx = pool.begin().await?;
    for (src, dest) in moves {
        let src = rebase(src, folder_moves);
        if src == *dest {
            continue;
        }

        let comic: Option<i64> = sqlx::query_scalar("SELECT id FROM comics WHERE library_id = ? AND path = ?")
            .bind(scope.library_id)
            .bind(path_str(&src))
            .fetch_optional(&mut *tx)
            .await?;
        let failed: Option<i64> =
            sqlx::query_scalar("SELECT id FROM failed_imports WHERE library_id = ? AND path = ?")
                .bind(scope.library_id)
                .bind(path_str(&src))
                .fetch_optional(&mut *tx)
                .await?;
        if comic.is_none() && failed.is_none() {
            tracing::debug!(target: "importer::persist", src = %src.display(), "Moved file not stored, skipping");
            continue;
        }

        for table in ["comics", "failed_imports"] {
            moved.changed += sqlx::query(&format!("DELETE FROM {table} WHERE library_id = ? AND path = ?"))
                .bind(scope.library_id)
                .bind(path_str(dest))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        let parent_id = parent_folder(&mut tx, scope, dest).await?;
        for (table, id) in [("comics", comic), ("failed_imports", failed)] {
            let Some(id) = id else { continue };
            let sql = format!(
                "UPDATE {table} SET path = ?, name = ?, parent_folder_id = ?, stat = ?, updated_at = {TIMESTAMP} WHERE id = ?"
            );
            moved.changed += sqlx::query(&sql)
                .bind(path_str(dest))
                .bind(file_name(dest))
                .bind(parent_id)
                .bind(stat_json(dest))
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        if let Some(id) = comic {
            moved.comics.push((id, src, dest.clone()));
        }
    }
    tx.commit().await?;
    Ok(moved)
}

/// Refresh the stored stat of modified directories.
pub async fn update_folder_stats(pool: &SqlitePool, scope: Scope<'_>, dirs: &BTreeSet<PathBuf>) -> Result<u64> {
    if dirs.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut changed = 0;
    for dir in dirs {
        let stat = stat_json(dir);
        changed += sqlx::query(
            "UPDATE folders SET stat = ?1, updated_at = ?2 WHERE library_id = ?3 AND path = ?4 AND stat IS NOT ?1",
        )
        .bind(stat)
        .bind(crate::db::now())
        .bind(scope.library_id)
        .bind(path_str(dir))
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(changed)
}

// ============================================================================
// Comics
// ============================================================================

const COMIC_COLUMNS: [&str; 21] = [
    "library_id",
    "path",
    "name",
    "parent_folder_id",
    "stat",
    "publisher_id",
    "imprint_id",
    "series_id",
    "volume_id",
    "title",
    "issue_number",
    "issue_suffix",
    "year",
    "month",
    "day",
    "summary",
    "age_rating",
    "language",
    "page_count",
    "file_type",
    "size",
];

struct ComicRow<'r> {
    record: &'r ComicRecord,
    parent_id: Option<i64>,
    groups: [i64; 4],
}

/// Insert new comics and update changed ones. Unchanged rows are untouched.
///
/// Writing a comic clears any failed import recorded at the same path and
/// points it at the earliest stored copy of the same issue, if any.
pub async fn upsert_comics(
    pool: &SqlitePool,
    scope: Scope<'_>,
    records: &BTreeMap<PathBuf, ComicRecord>,
    keys: &ResolvedKeys,
) -> Result<Upserted> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records.values() {
        let mut groups = [0i64; 4];
        let mut complete = true;
        for level in GroupLevel::ALL {
            match keys.groups.get(&record.group_path(level)) {
                Some(id) => groups[level as usize] = *id,
                None => complete = false,
            }
        }
        if !complete {
            tracing::warn!(target: "importer::persist", path = %record.path.display(), "Unresolved group, skipping comic");
            continue;
        }
        let parent_id = record
            .path
            .parent()
            .filter(|p| *p != scope.root)
            .and_then(|p| keys.folders.get(p).copied());
        rows.push(ComicRow {
            record,
            parent_id,
            groups,
        });
    }

    let updates = COMIC_COLUMNS[2..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let differs = COMIC_COLUMNS[2..]
        .iter()
        .map(|c| format!("comics.{c} IS NOT excluded.{c}"))
        .collect::<Vec<_>>()
        .join(" OR ");

    let mut upserted = Upserted::default();
    let mut tx = pool.begin().await?;
    for chunk in batches(&rows, scope.cap, COMIC_COLUMNS.len(), 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("INSERT INTO comics ({}) ", COMIC_COLUMNS.join(", ")));
        qb.push_values(chunk, |mut b, row| {
            let r = row.record;
            let f = &r.fields;
            b.push_bind(scope.library_id)
                .push_bind(path_str(&r.path))
                .push_bind(r.name.clone())
                .push_bind(row.parent_id)
                .push_bind(r.stat.map(|s| s.to_json()))
                .push_bind(row.groups[0])
                .push_bind(row.groups[1])
                .push_bind(row.groups[2])
                .push_bind(row.groups[3])
                .push_bind(f.title.clone())
                .push_bind(f.issue_number)
                .push_bind(f.issue_suffix.clone())
                .push_bind(f.year)
                .push_bind(f.month)
                .push_bind(f.day)
                .push_bind(f.summary.clone())
                .push_bind(f.age_rating.clone())
                .push_bind(f.language.clone())
                .push_bind(f.page_count)
                .push_bind(f.file_type.clone())
                .push_bind(r.size());
        });
        qb.push(format!(
            " ON CONFLICT(library_id, path) DO UPDATE SET {updates}, updated_at = {TIMESTAMP} \
             WHERE {differs} RETURNING id, path"
        ));
        let written: Vec<(i64, String)> = qb.build_query_as().fetch_all(&mut *tx).await?;
        upserted.changed += written.len() as u64;
        upserted
            .written
            .extend(written.into_iter().map(|(id, p)| (PathBuf::from(p), id)));
    }

    // Later copies of an issue point at the first one stored
    let ids: Vec<i64> = upserted.written.values().copied().collect();
    for chunk in batches(&ids, scope.cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE comics SET variant_of_id = ( \
                 SELECT MIN(o.id) FROM comics o \
                 WHERE o.library_id = comics.library_id AND o.volume_id = comics.volume_id \
                   AND o.issue_number = comics.issue_number AND o.issue_suffix IS comics.issue_suffix \
                   AND o.id < comics.id) \
             WHERE id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        qb.build().execute(&mut *tx).await?;
    }

    let paths: Vec<String> = rows.iter().map(|r| path_str(&r.record.path)).collect();
    for chunk in batches(&paths, scope.cap, 1, 1) {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM failed_imports WHERE library_id = ");
        qb.push_bind(scope.library_id);
        qb.push(" AND path IN (");
        let mut sep = qb.separated(", ");
        for path in chunk {
            sep.push_bind(path.clone());
        }
        sep.push_unseparated(")");
        upserted.cleared_failed += qb.build().execute(&mut *tx).await?.rows_affected();
    }
    tx.commit().await?;

    upserted.changed += upserted.cleared_failed;
    Ok(upserted)
}

/// Ids of stored comics at `paths`.
pub async fn comic_ids(
    pool: &SqlitePool,
    scope: Scope<'_>,
    paths: &BTreeSet<PathBuf>,
) -> Result<BTreeMap<PathBuf, i64>> {
    let paths: Vec<String> = paths.iter().map(|p| path_str(p)).collect();
    let mut found = BTreeMap::new();
    for chunk in batches(&paths, scope.cap, 1, 1) {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, path FROM comics WHERE library_id = ");
        qb.push_bind(scope.library_id);
        qb.push(" AND path IN (");
        let mut sep = qb.separated(", ");
        for path in chunk {
            sep.push_bind(path.clone());
        }
        sep.push_unseparated(")");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(pool).await?;
        found.extend(rows.into_iter().map(|(id, p)| (PathBuf::from(p), id)));
    }
    Ok(found)
}

/// Record decode failures.
///
/// A comic that used to be stored at a failing path is removed, so the
/// failure is visible instead of stale metadata.
pub async fn record_failed(
    pool: &SqlitePool,
    scope: Scope<'_>,
    failed: &BTreeMap<PathBuf, FailedRecord>,
    keys: &ResolvedKeys,
) -> Result<Removed> {
    let mut removed = Removed::default();
    if failed.is_empty() {
        return Ok(removed);
    }

    let mut tx = pool.begin().await?;
    for record in failed.values() {
        let gone: Vec<(i64,)> = sqlx::query_as("DELETE FROM comics WHERE library_id = ? AND path = ? RETURNING id")
            .bind(scope.library_id)
            .bind(path_str(&record.path))
            .fetch_all(&mut *tx)
            .await?;
        for (id,) in gone {
            removed.changed += 1;
            removed.comics.push((id, record.path.clone()));
        }

        let parent_id = record
            .path
            .parent()
            .filter(|p| *p != scope.root)
            .and_then(|p| keys.folders.get(p).copied());
        removed.changed += sqlx::query(&format!(
            r#"
            INSERT INTO failed_imports (library_id, path, name, parent_folder_id, stat, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(library_id, path) DO UPDATE SET
                name = excluded.name, parent_folder_id = excluded.parent_folder_id,
                stat = excluded.stat, reason = excluded.reason, updated_at = {TIMESTAMP}
            WHERE failed_imports.reason IS NOT excluded.reason
               OR failed_imports.stat IS NOT excluded.stat
               OR failed_imports.parent_folder_id IS NOT excluded.parent_folder_id
            "#
        ))
        .bind(scope.library_id)
        .bind(path_str(&record.path))
        .bind(&record.name)
        .bind(parent_id)
        .bind(record.stat.map(|s| s.to_json()))
        .bind(&record.reason)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}

// ============================================================================
// Relations
// ============================================================================

/// Current link targets of `comic_ids` in one link table.
async fn load_links(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    comic_ids: &[i64],
    cap: usize,
) -> Result<HashMap<i64, BTreeSet<i64>>> {
    let mut links: HashMap<i64, BTreeSet<i64>> = HashMap::new();
    for chunk in batches(comic_ids, cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT comic_id, {column} FROM {table} WHERE comic_id IN ("));
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        let rows: Vec<(i64, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for (comic, target) in rows {
            links.entry(comic).or_default().insert(target);
        }
    }
    Ok(links)
}

/// Make each comic's links in `table` exactly `desired`.
///
/// Comics whose links already match are left alone; others have their
/// links replaced wholesale.
async fn sync_links(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    desired: &BTreeMap<i64, BTreeSet<i64>>,
    cap: usize,
) -> Result<u64> {
    let ids: Vec<i64> = desired.keys().copied().collect();
    let existing = load_links(conn, table, column, &ids, cap).await?;

    let empty = BTreeSet::new();
    let stale: Vec<i64> = desired
        .iter()
        .filter(|(id, want)| existing.get(*id).unwrap_or(&empty) != *want)
        .map(|(id, _)| *id)
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }

    let mut changed = 0;
    for chunk in batches(&stale, cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE comic_id IN ("));
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        changed += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    let rows: Vec<(i64, i64)> = stale
        .iter()
        .flat_map(|id| desired[id].iter().map(move |target| (*id, *target)))
        .collect();
    for chunk in batches(&rows, cap, 2, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("INSERT OR IGNORE INTO {table} (comic_id, {column}) "));
        qb.push_values(chunk, |mut b, (comic, target)| {
            b.push_bind(*comic).push_bind(*target);
        });
        changed += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(changed)
}

/// Link comics to their named entities and credits.
///
/// A failure in one relation kind is logged and does not stop the others.
pub async fn link_relations(
    pool: &SqlitePool,
    scope: Scope<'_>,
    comic_ids: &BTreeMap<PathBuf, i64>,
    relations: &BTreeMap<PathBuf, RelationLists>,
    keys: &ResolvedKeys,
) -> Result<u64> {
    let mut changed = 0;
    let empty_names = HashMap::new();

    for kind in NamedKind::ALL {
        let ids = keys.named.get(&kind).unwrap_or(&empty_names);
        let desired: BTreeMap<i64, BTreeSet<i64>> = comic_ids
            .iter()
            .map(|(path, comic)| {
                let targets = relations
                    .get(path)
                    .and_then(|r| r.named.get(&kind))
                    .map(|names| names.iter().filter_map(|n| ids.get(n).copied()).collect())
                    .unwrap_or_default();
                (*comic, targets)
            })
            .collect();
        changed += sync_relation(pool, kind.link_table(), kind.link_column(), &desired, scope.cap).await;
    }

    let desired: BTreeMap<i64, BTreeSet<i64>> = comic_ids
        .iter()
        .map(|(path, comic)| {
            let targets = relations
                .get(path)
                .map(|r| r.credits.iter().filter_map(|c| keys.credits.get(c).copied()).collect())
                .unwrap_or_default();
            (*comic, targets)
        })
        .collect();
    changed += sync_relation(pool, "comic_credits", "credit_id", &desired, scope.cap).await;

    Ok(changed)
}

async fn sync_relation(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    desired: &BTreeMap<i64, BTreeSet<i64>>,
    cap: usize,
) -> u64 {
    let result = async {
        let mut tx = pool.begin().await?;
        let changed = sync_links(&mut tx, table, column, desired, cap).await?;
        tx.commit().await?;
        Ok::<_, crate::error::Error>(changed)
    }
    .await;
    match result {
        Ok(changed) => changed,
        Err(e) => {
            tracing::error!(target: "importer::persist", table, error = %e, "Failed to link relations");
            0
        }
    }
}

/// Point each comic's folder links at all of its current ancestors.
pub async fn relink_folders(pool: &SqlitePool, scope: Scope<'_>, comics: &BTreeMap<PathBuf, i64>) -> Result<u64> {
    if comics.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;

    let all_ancestors: BTreeSet<PathBuf> = comics
        .keys()
        .flat_map(|p| ancestors(scope.root, p))
        .collect();
    let folders = lookup_folders(&mut tx, scope.library_id, &all_ancestors, scope.cap).await?;

    let desired: BTreeMap<i64, BTreeSet<i64>> = comics
        .iter()
        .map(|(path, id)| {
            let targets = ancestors(scope.root, path)
                .iter()
                .filter_map(|a| folders.get(a).copied())
                .collect();
            (*id, targets)
        })
        .collect();

    let changed = sync_links(&mut tx, "comic_folders", "folder_id", &desired, scope.cap).await?;
    tx.commit().await?;
    Ok(changed)
}

// ============================================================================
// Deletes
// ============================================================================

/// Delete folders and everything beneath them.
pub async fn delete_folders(pool: &SqlitePool, scope: Scope<'_>, dirs: &BTreeSet<PathBuf>) -> Result<Removed> {
    let mut removed = Removed::default();
    if dirs.is_empty() {
        return Ok(removed);
    }
    let mut tx = pool.begin().await?;
    for dir in dirs {
        removed.comics.extend(comics_under(&mut tx, scope.library_id, dir).await?);
        for table in ["comics", "failed_imports", "folders"] {
            removed.changed += delete_subtree(&mut tx, scope.library_id, table, dir).await?;
        }
    }
    tx.commit().await?;
    Ok(removed)
}

/// Delete comics and failed imports at `paths`.
pub async fn delete_comics(pool: &SqlitePool, scope: Scope<'_>, paths: &BTreeSet<PathBuf>) -> Result<Removed> {
    let mut removed = Removed::default();
    let paths: Vec<String> = paths.iter().map(|p| path_str(p)).collect();
    if paths.is_empty() {
        return Ok(removed);
    }

    let mut tx = pool.begin().await?;
    for chunk in batches(&paths, scope.cap, 1, 1) {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM comics WHERE library_id = ");
        qb.push_bind(scope.library_id);
        qb.push(" AND path IN (");
        let mut sep = qb.separated(", ");
        for path in chunk {
            sep.push_bind(path.clone());
        }
        sep.push_unseparated(") RETURNING id, path");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&mut *tx).await?;
        removed.changed += rows.len() as u64;
        removed
            .comics
            .extend(rows.into_iter().map(|(id, p)| (id, PathBuf::from(p))));

        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM failed_imports WHERE library_id = ");
        qb.push_bind(scope.library_id);
        qb.push(" AND path IN (");
        let mut sep = qb.separated(", ");
        for path in chunk {
            sep.push_bind(path.clone());
        }
        sep.push_unseparated(")");
        removed.changed += qb.build().execute(&mut *tx).await?.rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}
