//! Read-only monitoring views backing the HTTP health, metrics, and
//! consistency endpoints.
//!
//! Nothing here mutates state; every function is a query composed from
//! `taskrelay-db`'s existing read views.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use taskrelay_db::models::{TaskAttempt, WorkerHeartbeat};
use taskrelay_db::queries::{attempts as attempts_db, heartbeats as heartbeats_db, tasks as tasks_db};
use taskrelay_db::queries::tasks::TaskCounts;

/// Snapshot of attempt throughput over a time window.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptMetrics {
    pub succeeded: i64,
    pub failed: i64,
}

impl AttemptMetrics {
    /// Fraction of completed attempts that succeeded, in `[0.0, 1.0]`.
    /// `1.0` when the window has no completed attempts at all (vacuously
    /// healthy -- there is nothing to report as a failure).
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            1.0
        } else {
            self.succeeded as f64 / total as f64
        }
    }
}

/// Counts of tasks by status, for the `/health` and metrics surfaces.
pub async fn task_counts(pool: &PgPool) -> Result<TaskCounts> {
    tasks_db::get_task_counts(pool).await
}

/// Workers whose heartbeat is fresh as of `now - heartbeat_timeout_ms`.
pub async fn active_workers(pool: &PgPool, heartbeat_timeout_ms: i64) -> Result<Vec<WorkerHeartbeat>> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(heartbeat_timeout_ms);
    heartbeats_db::find_active_workers(pool, cutoff).await
}

/// Workers whose heartbeat has gone stale, for an operator-facing view
/// distinct from what the Failure Detector acts on.
pub async fn stale_workers(pool: &PgPool, heartbeat_timeout_ms: i64) -> Result<Vec<WorkerHeartbeat>> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(heartbeat_timeout_ms);
    heartbeats_db::find_stale_workers(pool, cutoff).await
}

/// Succeeded/failed attempt counts over the last `hours`.
pub async fn attempt_metrics(pool: &PgPool, hours: i64) -> Result<AttemptMetrics> {
    let since: DateTime<Utc> = Utc::now() - chrono::Duration::hours(hours.max(1));
    let (succeeded, failed) = attempts_db::count_attempts_since(pool, since).await?;
    Ok(AttemptMetrics { succeeded, failed })
}

/// In-flight attempts that have been running longer than `threshold_ms`,
/// for an operator-facing view of work that may never complete (a worker
/// died mid-attempt but the owning task hasn't been reclaimed yet).
pub async fn stuck_attempts(pool: &PgPool, threshold_ms: i64) -> Result<Vec<TaskAttempt>> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(threshold_ms);
    attempts_db::find_stuck_attempts(pool, cutoff).await
}

/// Property P9: the sum of per-status counts must equal the total row
/// count. A mismatch would indicate a status value outside the domain
/// (I1 violated) or a counting bug; returns `Ok(true)` when consistent.
pub async fn counts_are_consistent(pool: &PgPool) -> Result<bool> {
    let counts = tasks_db::get_task_counts(pool).await.context("failed to load task counts")?;
    let sum = counts.pending + counts.running + counts.success + counts.failed;
    Ok(sum == counts.total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_metrics_default_is_zeroed() {
        let metrics = AttemptMetrics::default();
        assert_eq!(metrics.succeeded, 0);
        assert_eq!(metrics.failed, 0);
    }

    #[test]
    fn success_rate_with_no_attempts_is_vacuously_healthy() {
        assert_eq!(AttemptMetrics::default().success_rate(), 1.0);
    }

    #[test]
    fn success_rate_divides_succeeded_by_total() {
        let metrics = AttemptMetrics { succeeded: 3, failed: 1 };
        assert_eq!(metrics.success_rate(), 0.75);
    }
}
