//! Orphan cleanup.
//!
//! After a batch is persisted, groups, named entities, credits and folders
//! that nothing refers to any more are deleted. Groups are swept bottom up
//! so that emptying a volume can empty its series, and so on. Default
//! members are swept like any other group.
//!
//! Failed imports are reconciled in the same pass: a row goes once its
//! path holds a comic or no longer exists on disk.

use std::path::{MAIN_SEPARATOR_STR, Path};

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::batches;
use crate::error::{Error, Result, ResultExt};
use crate::model::{GroupLevel, NamedKind};

/// Rows deleted by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub groups: u64,
    pub named: u64,
    pub credits: u64,
    pub folders: u64,
    pub failed_imports: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.groups + self.named + self.credits + self.folders + self.failed_imports
    }
}

/// Failed imports of `library_id` whose file is gone.
async fn vanished_failed_imports(pool: &SqlitePool, library_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, path FROM failed_imports WHERE library_id = ?")
        .bind(library_id)
        .fetch_all(pool)
        .await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || {
        rows.into_iter()
            .filter(|(_, path)| !Path::new(path).exists())
            .map(|(id, _)| id)
            .collect()
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))
}

/// Delete everything no comic refers to.
///
/// Folders are swept per library; the shared tables are swept globally
/// since several libraries may refer to the same publisher or tag.
/// Vanished failed imports are deleted in `IN` lists of at most `cap` ids.
pub async fn cleanup_orphans(pool: &SqlitePool, library_id: i64, cap: usize) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let vanished = vanished_failed_imports(pool, library_id).await?;
    let mut tx = pool.begin().await?;

    report.failed_imports += sqlx::query(
        r#"
        DELETE FROM failed_imports
        WHERE library_id = ?
          AND EXISTS (
              SELECT 1 FROM comics c
              WHERE c.library_id = failed_imports.library_id AND c.path = failed_imports.path
          )
        "#,
    )
    .bind(library_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    for chunk in batches(&vanished, cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM failed_imports WHERE id IN (");
        let mut ids = qb.separated(", ");
        for id in chunk {
            ids.push_bind(*id);
        }
        qb.push(")");
        report.failed_imports += qb.build().execute(&mut *tx).await?.rows_affected();
    }

    // Volumes first: a level is orphaned when no comic and no child uses it
    for level in GroupLevel::ALL.into_iter().rev() {
        let child = match level {
            GroupLevel::Publisher => Some(("imprints", "publisher_id")),
            GroupLevel::Imprint => Some(("series", "imprint_id")),
            GroupLevel::Series => Some(("volumes", "series_id")),
            GroupLevel::Volume => None,
        };
        let mut sql = format!(
            "DELETE FROM {table} WHERE NOT EXISTS (SELECT 1 FROM comics c WHERE c.{column} = {table}.id)",
            table = level.table(),
            column = level.comic_column(),
        );
        if let Some((child_table, child_column)) = child {
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM {child_table} x WHERE x.{child_column} = {}.id)",
                level.table()
            ));
        }
        report.groups += sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
    }

    for kind in NamedKind::ALL {
        let sql = format!(
            "DELETE FROM {table} WHERE NOT EXISTS (SELECT 1 FROM {link} l WHERE l.{column} = {table}.id)",
            table = kind.table(),
            link = kind.link_table(),
            column = kind.link_column(),
        );
        report.named += sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
    }

    for sql in [
        "DELETE FROM credits WHERE NOT EXISTS (SELECT 1 FROM comic_credits l WHERE l.credit_id = credits.id)",
        "DELETE FROM credit_persons WHERE NOT EXISTS (SELECT 1 FROM credits c WHERE c.person_id = credit_persons.id)",
        "DELETE FROM credit_roles WHERE NOT EXISTS (SELECT 1 FROM credits c WHERE c.role_id = credit_roles.id)",
    ] {
        report.credits += sqlx::query(sql).execute(&mut *tx).await?.rows_affected();
    }

    // A folder survives while any comic or failed import lives beneath it
    report.folders += sqlx::query(
        r#"
        DELETE FROM folders
        WHERE library_id = ?1
          AND NOT EXISTS (
              SELECT 1 FROM comics c
              WHERE c.library_id = ?1 AND substr(c.path, 1, length(folders.path) + 1) = folders.path || ?2
          )
          AND NOT EXISTS (
              SELECT 1 FROM failed_imports f
              WHERE f.library_id = ?1 AND substr(f.path, 1, length(folders.path) + 1) = folders.path || ?2
          )
        "#,
    )
    .bind(library_id)
    .bind(MAIN_SEPARATOR_STR)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await.with_context("committing orphan cleanup")?;

    if report.total() > 0 {
        tracing::debug!(
            target: "importer::cleanup",
            library = library_id,
            groups = report.groups,
            named = report.named,
            credits = report.credits,
            folders = report.folders,
            failed_imports = report.failed_imports,
            "Orphans removed"
        );
    }
    Ok(report)
}
