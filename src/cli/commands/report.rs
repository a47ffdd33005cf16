//! Read-only reports: comics, failed imports and phase status.

use sqlx::SqlitePool;

use crate::config::Config;
use crate::cover::CoverCache;
use crate::db;
use crate::status;

/// List imported comics
pub async fn cmd_list(pool: &SqlitePool, library: Option<i64>) -> anyhow::Result<()> {
    let comics = db::get_comics(pool, library).await?;
    for comic in &comics {
        let issue = comic
            .issue_number
            .map(|n| format!(" #{n}{}", comic.issue_suffix.as_deref().unwrap_or("")))
            .unwrap_or_default();
        let year = comic.year.map(|y| format!(" ({y})")).unwrap_or_default();
        println!(
            "{:>6}  {}{issue}{year}  {}",
            comic.id,
            comic.title.as_deref().unwrap_or(&comic.name),
            comic.path
        );
    }
    println!("{} comic(s)", comics.len());
    Ok(())
}

/// Show or dismiss failed imports
pub async fn cmd_failed(pool: &SqlitePool, library: Option<i64>, dismiss: Option<i64>) -> anyhow::Result<()> {
    if let Some(id) = dismiss {
        if db::dismiss_failed_import(pool, id).await? {
            println!("Dismissed failed import {id}");
            return Ok(());
        }
        anyhow::bail!("No failed import with id {id}");
    }

    let failed = db::get_failed_imports(pool, library).await?;
    if failed.is_empty() {
        println!("No failed imports.");
        return Ok(());
    }
    for row in &failed {
        println!("{:>6}  {}", row.id, row.path);
        println!("        {} ({})", row.reason, row.updated_at);
    }
    println!("{} failed import(s)", failed.len());
    Ok(())
}

/// Show the status registry, table counts and cover cache size
pub async fn cmd_status(pool: &SqlitePool, config: &Config) -> anyhow::Result<()> {
    let rows = status::get_all(pool).await?;
    if rows.is_empty() {
        println!("No sync phase has run yet.");
    }
    for row in rows {
        let progress = match (row.complete, row.total) {
            (Some(done), Some(total)) => format!("{done}/{total}"),
            (Some(done), None) => done.to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:<14} {:<8} {:>12}  updated {}",
            row.kind,
            if row.active { "active" } else { "idle" },
            progress,
            row.updated_at
        );
    }

    let counts = db::table_counts(pool).await?;
    println!();
    println!(
        "comics: {}  folders: {}  failed: {}",
        counts.comics, counts.folders, counts.failed_imports
    );
    println!(
        "publishers: {}  imprints: {}  series: {}  volumes: {}",
        counts.publishers, counts.imprints, counts.series, counts.volumes
    );

    let covers = CoverCache::from_config(&config.covers);
    println!("cover cache: {} KiB", covers.size_bytes() / 1024);
    Ok(())
}
