//! One-shot syncs and the sync daemon.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::error::Error;
use crate::importer::{ImportSettings, Importer};
use crate::metadata::DefaultDecoder;
use crate::scanner::poller::{PollOutcome, poll_library};
use crate::status;
use crate::tasks::workers::LoggingIndex;
use crate::tasks::{DispatcherHandle, Task, WatchTask};

/// Poll libraries and import what changed, in this process.
pub async fn cmd_sync(
    pool: &SqlitePool,
    config: &Config,
    library: Option<i64>,
    force: bool,
) -> anyhow::Result<()> {
    let libraries = match library {
        Some(id) => vec![db::get_library(pool, id).await?],
        None => db::get_libraries(pool).await?,
    };
    if libraries.is_empty() {
        println!("No libraries to sync.");
        return Ok(());
    }

    let importer = Importer::new(
        pool.clone(),
        Arc::new(DefaultDecoder),
        ImportSettings::from(&config.sync),
    );

    let mut failures = 0;
    for library in libraries {
        println!("Syncing library {}: {}", library.id, library.path);
        let diff = match poll_library(pool, &library, force).await? {
            PollOutcome::Changed(diff) => diff,
            PollOutcome::Unchanged => {
                println!("  No changes.");
                continue;
            }
            PollOutcome::Unreachable => {
                eprintln!("  Library root is missing or empty, skipped.");
                failures += 1;
                continue;
            }
        };

        match importer.apply(library.id, diff).await {
            Ok(report) => {
                println!(
                    "  {} written, {} removed, {} failed, {} orphans cleaned",
                    report.written.len(),
                    report.removed.len(),
                    report.failed,
                    report.cleanup.total()
                );
                if !report.failed_phases.is_empty() {
                    eprintln!("  Failed phases: {}", report.failed_phases.join(", "));
                    failures += 1;
                }
            }
            Err(Error::LibraryBusy(_)) => {
                eprintln!("  Library is being updated by another process (is the daemon running?).");
                failures += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} library sync(s) did not complete");
    }
    Ok(())
}

/// Run the sync daemon until Ctrl-C.
pub async fn cmd_run(pool: SqlitePool, config: &Config) -> anyhow::Result<()> {
    // Leftovers of a crashed run
    let stale = db::clear_stale_updates(&pool).await?;
    if stale > 0 {
        warn!(target: "daemon", libraries = stale, "Cleared stale update flags");
    }
    status::reset_all(&pool).await?;

    let handle = DispatcherHandle::start(
        pool,
        config,
        Arc::new(DefaultDecoder),
        Arc::new(LoggingIndex::default()),
    )?;

    let mut notifications = handle.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            info!(target: "daemon", ?notification, "Notification");
        }
    });

    // Pick up library changes made by other processes
    let reload_every = config.sync.poll_min_interval();
    let tasks = handle.sender();
    let reloader = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reload_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !tasks.send(Task::Watch(WatchTask::Reload)) {
                break;
            }
        }
    });

    println!("Syncing. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    println!("Stopping...");

    reloader.abort();
    handle.shutdown().await;
    listener.abort();
    info!(target: "daemon", "Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{temp_db, temp_library};

    #[tokio::test]
    async fn test_sync_imports_and_fails_bad_archives() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        // A real zip local header, and a file that only claims to be one
        let good = root.path().join("Saga").join("Saga 001 (2012).cbz");
        std::fs::create_dir_all(good.parent().unwrap()).unwrap();
        std::fs::write(&good, b"PK\x03\x04 archive body").unwrap();
        std::fs::write(root.path().join("Saga").join("broken.cbz"), b"not an archive").unwrap();

        let mut config = Config::default();
        config.sync.wait_for_copies = false;
        cmd_sync(&pool, &config, Some(library_id), false).await.unwrap();

        let comics = db::get_comics(&pool, Some(library_id)).await.unwrap();
        assert_eq!(comics.len(), 1);
        let failed = db::get_failed_imports(&pool, Some(library_id)).await.unwrap();
        assert_eq!(failed.len(), 1);

        // Nothing changed on disk
        cmd_sync(&pool, &config, Some(library_id), false).await.unwrap();
        assert_eq!(db::get_comics(&pool, Some(library_id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_reports_busy_library() {
        let (pool, _dir) = temp_db().await;
        let (library_id, root) = temp_library(&pool).await;
        std::fs::write(root.path().join("a.cbz"), b"PK\x03\x04 archive body").unwrap();
        assert!(db::try_begin_update(&pool, library_id).await.unwrap());

        let mut config = Config::default();
        config.sync.wait_for_copies = false;
        assert!(cmd_sync(&pool, &config, Some(library_id), false).await.is_err());
    }
}
