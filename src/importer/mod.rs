//! Applies a batched filesystem diff to the database.
//!
//! # Pipeline
//!
//! ```text
//! SnapshotDiff → normalize → wait for copies → decode (parallel)
//!     → create missing foreign keys → persist phases → orphan cleanup
//! ```
//!
//! A sync claims its library through the `update_in_progress` flag and
//! always releases it, whatever the outcome. Per-file decode failures
//! become failed imports. A database error in one persistence phase is
//! logged and recorded in the report while the later phases still run;
//! only the steps those phases depend on (foreign keys, folders, key
//! lookup) abort the sync. Replaying the same diff against the resulting
//! database changes nothing.

pub mod aggregate;
pub mod cleanup;
pub mod foreign_keys;
pub mod persist;
mod wait;

pub use aggregate::{Aggregate, ComicRecord, FailedRecord, GroupPath, PendingForeignKeys, aggregate};
pub use cleanup::{CleanupReport, cleanup_orphans};
pub use wait::wait_for_copies;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::db;
use crate::error::{Error, Result, ResultExt};
use crate::metadata::MetadataDecoder;
use crate::scanner::is_comic_archive;
use crate::snapshot::{ChangeSet, SnapshotDiff};
use crate::status::{StatusKind, StatusTracker};
use persist::Scope;

/// Split `items` so no statement binds more than `cap` parameters.
///
/// `per_item` parameters are bound for each item and `fixed` once per
/// statement. A chunk always holds at least one item.
pub(crate) fn batches<T>(items: &[T], cap: usize, per_item: usize, fixed: usize) -> std::slice::Chunks<'_, T> {
    let size = (cap.saturating_sub(fixed) / per_item.max(1)).max(1);
    items.chunks(size)
}

/// Importer tuning.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    /// Maximum bound parameters per statement
    pub cap: usize,
    pub wait_for_copies: bool,
    pub copy_wait_poll: Duration,
    pub copy_wait_expiry: Duration,
}

impl From<&SyncConfig> for ImportSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            cap: config.predicate_cap(),
            wait_for_copies: config.wait_for_copies,
            copy_wait_poll: config.copy_wait_poll(),
            copy_wait_expiry: config.copy_wait_expiry(),
        }
    }
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// What one sync did.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub library_id: i64,
    /// Rows created, updated or deleted across every phase
    pub changed: u64,
    /// Comics inserted, updated or moved
    pub written: Vec<i64>,
    /// Comics deleted
    pub removed: Vec<i64>,
    /// Covers to extract, with whether to replace a cached one
    pub covers: Vec<(PathBuf, bool)>,
    /// Paths whose cached covers are stale
    pub purged: Vec<PathBuf>,
    /// Paths that failed to decode in this batch
    pub failed: usize,
    pub failed_imports_changed: bool,
    pub cleanup: CleanupReport,
    /// Phases that failed and were skipped over
    pub failed_phases: Vec<&'static str>,
}

impl ImportReport {
    /// Nothing in the database changed.
    pub fn is_noop(&self) -> bool {
        self.changed == 0 && self.cleanup.total() == 0
    }
}

/// Drop contradictions from a diff before applying it.
///
/// A path that was also created, modified or moved onto is not deleted;
/// a created path is not also modified; files that are not comic
/// archives are ignored, and a move between an archive and anything else
/// becomes a plain create or delete.
pub fn normalize(diff: &mut SnapshotDiff) {
    let files = &mut diff.files;
    files.created.retain(|p| is_comic_archive(p));
    files.modified.retain(|p| is_comic_archive(p));
    let moves = std::mem::take(&mut files.moved);
    for (src, dest) in moves {
        match (is_comic_archive(&src), is_comic_archive(&dest)) {
            (true, true) => {
                files.moved.insert(src, dest);
            }
            (true, false) => {
                files.deleted.insert(src);
            }
            (false, true) => {
                files.created.insert(dest);
            }
            (false, false) => {}
        }
    }

    for set in [&mut diff.dirs, &mut diff.files] {
        set.moved.retain(|src, dest| src != dest);
        let ChangeSet {
            created,
            deleted,
            modified,
            moved,
        } = set;
        deleted.retain(|p| !created.contains(p) && !modified.contains(p));
        for dest in moved.values() {
            deleted.remove(dest);
            created.remove(dest);
        }
        modified.retain(|p| !created.contains(p));
    }
}

/// Archives beneath `dirs`, found by walking the disk.
fn archives_under(dirs: &[PathBuf]) -> BTreeSet<PathBuf> {
    dirs.iter()
        .flat_map(|d| WalkDir::new(d).follow_links(false).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file() && is_comic_archive(e.path()))
        .map(|e| e.into_path())
        .collect()
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}

/// Run one independent phase; a failure is logged and recorded, and the
/// phase counts as having done nothing.
async fn phase<T: Default>(report: &mut ImportReport, name: &'static str, work: impl Future<Output = Result<T>>) -> T {
    match work.await {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(target: "importer", library = report.library_id, phase = name, error = %e, "Phase failed, continuing");
            report.failed_phases.push(name);
            T::default()
        }
    }
}

/// Applies diffs to the database.
#[derive(Clone)]
pub struct Importer {
    pool: SqlitePool,
    decoder: Arc<dyn MetadataDecoder>,
    settings: ImportSettings,
}

impl Importer {
    pub fn new(pool: SqlitePool, decoder: Arc<dyn MetadataDecoder>, settings: ImportSettings) -> Self {
        Self {
            pool,
            decoder,
            settings,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply `diff` to library `library_id`.
    ///
    /// # Errors
    ///
    /// [`Error::LibraryBusy`] when another sync holds the library; the
    /// caller should retry later. Errors in the decode, foreign-key and
    /// folder steps abort the sync and are returned after the library is
    /// released. Failures in later phases only show up in
    /// [`ImportReport::failed_phases`].
    pub async fn apply(&self, library_id: i64, diff: SnapshotDiff) -> Result<ImportReport> {
        let library = db::get_library(&self.pool, library_id).await?;
        if !db::try_begin_update(&self.pool, library_id).await? {
            return Err(Error::LibraryBusy(library_id));
        }

        let root = PathBuf::from(&library.path);
        let result = self
            .apply_claimed(library_id, &root, diff)
            .await
            .with_context(format!("applying diff to library {library_id}"));

        if let Err(e) = db::end_update(&self.pool, library_id).await {
            tracing::error!(target: "importer", library = library_id, error = %e, "Failed to release library");
        }

        match &result {
            Ok(report) if report.is_noop() => {
                tracing::debug!(target: "importer", library = library_id, "Sync changed nothing");
            }
            Ok(report) if !report.failed_phases.is_empty() => {
                tracing::warn!(
                    target: "importer",
                    library = library_id,
                    changed = report.changed,
                    phases = ?report.failed_phases,
                    "Sync finished with failed phases"
                );
            }
            Ok(report) => {
                tracing::info!(
                    target: "importer",
                    library = library_id,
                    changed = report.changed,
                    written = report.written.len(),
                    removed = report.removed.len(),
                    failed = report.failed,
                    "Sync complete"
                );
            }
            Err(e) => {
                tracing::error!(target: "importer", library = library_id, error = %e, "Sync failed");
            }
        }
        result
    }

    /// Turn moves whose source the database never knew into creates.
    async fn resolve_unknown_moves(&self, scope: Scope<'_>, diff: &mut SnapshotDiff) -> Result<()> {
        let dir_sources: BTreeSet<PathBuf> = diff.dirs.moved.keys().cloned().collect();
        let known_dirs = persist::existing_paths(&self.pool, scope, "folders", &dir_sources).await?;
        let mut unknown_dests = Vec::new();
        diff.dirs.moved.retain(|src, dest| {
            let known = known_dirs.contains(src);
            if !known {
                unknown_dests.push(dest.clone());
            }
            known
        });

        let file_sources: BTreeSet<PathBuf> = diff.files.moved.keys().cloned().collect();
        let mut known_files = persist::existing_paths(&self.pool, scope, "comics", &file_sources).await?;
        known_files.extend(persist::existing_paths(&self.pool, scope, "failed_imports", &file_sources).await?);
        let files = &mut diff.files;
        let mut created = Vec::new();
        files.moved.retain(|src, dest| {
            let known = known_files.contains(src);
            if !known {
                created.push(dest.clone());
            }
            known
        });
        files.created.extend(created);

        if !unknown_dests.is_empty() {
            tracing::debug!(target: "importer", dirs = unknown_dests.len(), "Moved folders not stored, importing as new");
            let found = tokio::task::spawn_blocking(move || archives_under(&unknown_dests))
                .await
                .map_err(join_error)?;
            let move_dests: BTreeSet<&PathBuf> = diff.files.moved.values().collect();
            let fresh: Vec<PathBuf> = found.into_iter().filter(|p| !move_dests.contains(p)).collect();
            diff.files.created.extend(fresh);
        }
        Ok(())
    }

    async fn apply_claimed(&self, library_id: i64, root: &Path, mut diff: SnapshotDiff) -> Result<ImportReport> {
        let cap = self.settings.cap;
        let scope = Scope {
            library_id,
            root,
            cap,
        };
        let mut report = ImportReport {
            library_id,
            ..Default::default()
        };

        normalize(&mut diff);
        self.resolve_unknown_moves(scope, &mut diff).await?;
        normalize(&mut diff);
        if diff.is_empty() {
            return Ok(report);
        }
        tracing::debug!(target: "importer", library = library_id, ops = diff.len(), "Applying diff");

        let to_decode: BTreeSet<PathBuf> = diff
            .files
            .created
            .union(&diff.files.modified)
            .cloned()
            .collect();

        if self.settings.wait_for_copies && !to_decode.is_empty() {
            let tracker = StatusTracker::start(&self.pool, StatusKind::CopyWait, Some(to_decode.len() as u64)).await;
            let paths: Vec<PathBuf> = to_decode.iter().cloned().collect();
            wait_for_copies(&paths, self.settings.copy_wait_poll, self.settings.copy_wait_expiry).await;
            tracker.finish().await;
        }

        // Decode
        let mut tracker = StatusTracker::start(&self.pool, StatusKind::Decode, Some(to_decode.len() as u64)).await;
        let decode_count = to_decode.len() as u64;
        let extra: BTreeSet<PathBuf> = diff.files.moved.values().cloned().collect();
        let decoder = Arc::clone(&self.decoder);
        let decode_root = root.to_path_buf();
        let mut agg = tokio::task::spawn_blocking(move || aggregate(decoder.as_ref(), &decode_root, &to_decode, &extra))
            .await
            .map_err(join_error)?;
        tracker.advance(decode_count).await;
        tracker.finish().await;
        report.failed = agg.failed.len();

        for dest in diff.dirs.moved.values() {
            agg.pending.add_ancestors(root, dest);
            agg.pending.folders.insert(dest.clone());
        }

        // Foreign keys; folders under move destinations arrive with the move
        let tracker = StatusTracker::start(&self.pool, StatusKind::ForeignKeys, None).await;
        let mut fk_pending = agg.pending.clone();
        let move_dests: Vec<&PathBuf> = diff.dirs.moved.values().collect();
        fk_pending
            .folders
            .retain(|f| !move_dests.iter().any(|d| f.starts_with(d)));
        let missing = foreign_keys::find_missing(&self.pool, library_id, &fk_pending, cap).await?;
        report.changed += foreign_keys::create_missing(&self.pool, library_id, &missing, cap).await?;
        tracker.finish().await;

        let failed_before = phase(&mut report, "count failed imports", self.failed_import_count(library_id)).await;
        let mut tracker = StatusTracker::start(&self.pool, StatusKind::Persist, Some(9)).await;

        let (folder_moves, applied) =
            phase(&mut report, "move folders", persist::move_folders(&self.pool, scope, &diff.dirs.moved)).await;
        report.changed += folder_moves.changed;
        // Upserts need every parent folder in place
        {
            let mut conn = self.pool.acquire().await?;
            report.changed += foreign_keys::ensure_folders(&mut conn, library_id, &agg.pending.folders, cap).await?;
        }
        tracker.advance(1).await;

        let comic_moves = phase(
            &mut report,
            "move comics",
            persist::move_comics(&self.pool, scope, &diff.files.moved, &applied),
        )
        .await;
        report.changed += comic_moves.changed;
        tracker.advance(1).await;

        let refreshed = phase(
            &mut report,
            "update folder stats",
            persist::update_folder_stats(&self.pool, scope, &diff.dirs.modified),
        )
        .await;
        report.changed += refreshed;
        tracker.advance(1).await;

        let keys = foreign_keys::load_keys(&self.pool, library_id, &agg.pending, cap).await?;
        let upserted = phase(
            &mut report,
            "upsert comics",
            persist::upsert_comics(&self.pool, scope, &agg.records, &keys),
        )
        .await;
        report.changed += upserted.changed;
        tracker.advance(1).await;

        let replaced = phase(
            &mut report,
            "record failed imports",
            persist::record_failed(&self.pool, scope, &agg.failed, &keys),
        )
        .await;
        report.changed += replaced.changed;
        tracker.advance(1).await;

        let record_paths: BTreeSet<PathBuf> = agg.records.keys().cloned().collect();
        let stored = phase(&mut report, "load comic ids", persist::comic_ids(&self.pool, scope, &record_paths)).await;
        let linked = phase(
            &mut report,
            "link relations",
            persist::link_relations(&self.pool, scope, &stored, &agg.relations, &keys),
        )
        .await;
        report.changed += linked;
        tracker.advance(1).await;

        let mut relink: BTreeMap<PathBuf, i64> = stored.clone();
        for (id, _, new) in folder_moves.comics.iter().chain(&comic_moves.comics) {
            relink.insert(persist::rebase(new, &applied), *id);
        }
        let relinked = phase(&mut report, "relink folders", persist::relink_folders(&self.pool, scope, &relink)).await;
        report.changed += relinked;
        tracker.advance(1).await;

        let folder_deletes = phase(
            &mut report,
            "delete folders",
            persist::delete_folders(&self.pool, scope, &diff.dirs.deleted),
        )
        .await;
        report.changed += folder_deletes.changed;
        tracker.advance(1).await;

        let comic_deletes = phase(
            &mut report,
            "delete comics",
            persist::delete_comics(&self.pool, scope, &diff.files.deleted),
        )
        .await;
        report.changed += comic_deletes.changed;
        tracker.advance(1).await;
        tracker.finish().await;

        let tracker = StatusTracker::start(&self.pool, StatusKind::Cleanup, None).await;
        let cleanup = phase(&mut report, "cleanup", cleanup_orphans(&self.pool, library_id, cap)).await;
        report.cleanup = cleanup;
        tracker.finish().await;

        let failed_after = phase(&mut report, "count failed imports", self.failed_import_count(library_id)).await;
        report.failed_imports_changed =
            upserted.cleared_failed > 0 || replaced.changed > 0 || failed_before != failed_after;

        // Follow-up work for covers and search
        let mut written: BTreeSet<i64> = upserted.written.values().copied().collect();
        for (path, id) in &upserted.written {
            let replace = diff.files.modified.contains(path);
            report.covers.push((path.clone(), replace));
            written.insert(*id);
        }
        for (id, old, new) in folder_moves.comics.iter().chain(&comic_moves.comics) {
            let new = persist::rebase(new, &applied);
            written.insert(*id);
            report.purged.push(old.clone());
            report.covers.push((new, false));
        }
        let removed: Vec<(i64, PathBuf)> = replaced
            .comics
            .into_iter()
            .chain(folder_deletes.comics)
            .chain(comic_deletes.comics)
            .collect();
        for (id, path) in removed {
            written.remove(&id);
            report.removed.push(id);
            report.purged.push(path);
        }
        report.written = written.into_iter().collect();

        Ok(report)
    }

    async fn failed_import_count(&self, library_id: i64) -> Result<(i64, Option<String>)> {
        Ok(sqlx::query_as("SELECT COUNT(*), MAX(updated_at) FROM failed_imports WHERE library_id = ?")
            .bind(library_id)
            .fetch_one(&self.pool)
            .await?)
    }
}
