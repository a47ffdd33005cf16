//! Coarse progress registry.
//!
//! Each sync phase reports start, progress and finish under its
//! [`StatusKind`]. Rows live in the `status` table so any process sharing
//! the database can poll them without talking to the workers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::now;

/// Minimum gap between intermediate progress writes.
const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Phase types that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Poll,
    CopyWait,
    Decode,
    ForeignKeys,
    Persist,
    Cleanup,
    Covers,
    Search,
}

impl StatusKind {
    pub const ALL: [StatusKind; 8] = [
        StatusKind::Poll,
        StatusKind::CopyWait,
        StatusKind::Decode,
        StatusKind::ForeignKeys,
        StatusKind::Persist,
        StatusKind::Cleanup,
        StatusKind::Covers,
        StatusKind::Search,
    ];

    /// Key stored in the `status` table.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Poll => "poll",
            StatusKind::CopyWait => "copy_wait",
            StatusKind::Decode => "decode",
            StatusKind::ForeignKeys => "foreign_keys",
            StatusKind::Persist => "persist",
            StatusKind::Cleanup => "cleanup",
            StatusKind::Covers => "covers",
            StatusKind::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the registry.
#[derive(Debug, Clone, FromRow)]
pub struct StatusRow {
    pub kind: String,
    pub active: bool,
    pub complete: Option<i64>,
    pub total: Option<i64>,
    pub started_at: Option<String>,
    pub updated_at: String,
}

/// Mark a phase as started.
///
/// # Arguments
/// * `total` - Expected amount of work, if known
pub async fn start(pool: &SqlitePool, kind: StatusKind, total: Option<u64>) -> sqlx::Result<()> {
    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO status (kind, active, complete, total, started_at, updated_at)
        VALUES (?1, 1, 0, ?2, ?3, ?3)
        ON CONFLICT(kind) DO UPDATE SET
            active = 1, complete = 0, total = excluded.total,
            started_at = excluded.started_at, updated_at = excluded.updated_at
        "#,
    )
    .bind(kind.as_str())
    .bind(total.map(|t| t as i64))
    .bind(ts)
    .execute(pool)
    .await?;
    Ok(())
}

/// Report progress on a started phase.
pub async fn update(
    pool: &SqlitePool,
    kind: StatusKind,
    complete: u64,
    total: Option<u64>,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE status SET complete = ?, total = COALESCE(?, total), updated_at = ? WHERE kind = ?",
    )
    .bind(complete as i64)
    .bind(total.map(|t| t as i64))
    .bind(now())
    .bind(kind.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a phase as finished.
pub async fn finish(pool: &SqlitePool, kind: StatusKind) -> sqlx::Result<()> {
    sqlx::query("UPDATE status SET active = 0, updated_at = ? WHERE kind = ?")
        .bind(now())
        .bind(kind.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Read a single phase.
pub async fn get(pool: &SqlitePool, kind: StatusKind) -> sqlx::Result<Option<StatusRow>> {
    sqlx::query_as::<_, StatusRow>(
        "SELECT kind, active, complete, total, started_at, updated_at FROM status WHERE kind = ?",
    )
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await
}

/// Read the whole registry.
pub async fn get_all(pool: &SqlitePool) -> sqlx::Result<Vec<StatusRow>> {
    sqlx::query_as::<_, StatusRow>(
        "SELECT kind, active, complete, total, started_at, updated_at FROM status ORDER BY kind",
    )
    .fetch_all(pool)
    .await
}

/// Mark every phase inactive; used at startup after a crash.
pub async fn reset_all(pool: &SqlitePool) -> sqlx::Result<u64> {
    let result = sqlx::query("UPDATE status SET active = 0 WHERE active = 1")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Reports one phase's progress, throttling intermediate writes.
///
/// Registry failures are logged and never interrupt the phase.
pub struct StatusTracker {
    pool: SqlitePool,
    kind: StatusKind,
    total: Option<u64>,
    complete: u64,
    last_write: Instant,
}

impl StatusTracker {
    pub async fn start(pool: &SqlitePool, kind: StatusKind, total: Option<u64>) -> Self {
        if let Err(e) = start(pool, kind, total).await {
            tracing::warn!(target: "status", kind = %kind, error = %e, "Failed to record start");
        }
        Self {
            pool: pool.clone(),
            kind,
            total,
            complete: 0,
            last_write: Instant::now(),
        }
    }

    pub fn complete(&self) -> u64 {
        self.complete
    }

    /// Add `n` completed units.
    pub async fn advance(&mut self, n: u64) {
        self.complete += n;
        if self.last_write.elapsed() >= UPDATE_INTERVAL {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        self.last_write = Instant::now();
        if let Err(e) = update(&self.pool, self.kind, self.complete, self.total).await {
            tracing::warn!(target: "status", kind = %self.kind, error = %e, "Failed to record progress");
        }
    }

    pub async fn finish(mut self) {
        self.flush().await;
        if let Err(e) = finish(&self.pool, self.kind).await {
            tracing::warn!(target: "status", kind = %self.kind, error = %e, "Failed to record finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_db;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in StatusKind::ALL {
            assert_eq!(StatusKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StatusKind::parse("nope"), None);
    }

    #[tokio::test]
    async fn test_start_update_finish() {
        let (pool, _dir) = temp_db().await;

        start(&pool, StatusKind::Decode, Some(10)).await.unwrap();
        update(&pool, StatusKind::Decode, 4, None).await.unwrap();

        let row = get(&pool, StatusKind::Decode).await.unwrap().unwrap();
        assert!(row.active);
        assert_eq!(row.complete, Some(4));
        assert_eq!(row.total, Some(10));

        finish(&pool, StatusKind::Decode).await.unwrap();
        let row = get(&pool, StatusKind::Decode).await.unwrap().unwrap();
        assert!(!row.active);

        // Restarting resets progress
        start(&pool, StatusKind::Decode, None).await.unwrap();
        let row = get(&pool, StatusKind::Decode).await.unwrap().unwrap();
        assert_eq!(row.complete, Some(0));
        assert_eq!(row.total, None);
    }

    #[tokio::test]
    async fn test_tracker_writes_final_count() {
        let (pool, _dir) = temp_db().await;

        let mut tracker = StatusTracker::start(&pool, StatusKind::Persist, Some(3)).await;
        tracker.advance(1).await;
        tracker.advance(2).await;
        assert_eq!(tracker.complete(), 3);
        tracker.finish().await;

        let all = get_all(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, "persist");
        assert_eq!(all[0].complete, Some(3));
        assert!(!all[0].active);
    }

    #[tokio::test]
    async fn test_reset_all() {
        let (pool, _dir) = temp_db().await;
        start(&pool, StatusKind::Poll, None).await.unwrap();
        start(&pool, StatusKind::Cleanup, None).await.unwrap();

        assert_eq!(reset_all(&pool).await.unwrap(), 2);
        assert!(get_all(&pool).await.unwrap().iter().all(|r| !r.active));
    }
}
