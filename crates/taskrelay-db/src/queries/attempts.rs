//! Database query functions for the `task_attempts` table.
//!
//! An attempt row is created when the coordinator starts driving a claimed
//! task through its executor, and updated once when the executor returns.
//! `success` stays `null` for the window in between.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskAttempt;

/// Record the start of an execution attempt. Returns the inserted row
/// (its `id` is needed to finish the attempt later).
pub async fn record_attempt_start(pool: &PgPool, task_id: Uuid, worker_id: &str) -> Result<TaskAttempt> {
    let attempt = sqlx::query_as::<_, TaskAttempt>(
        "INSERT INTO task_attempts (task_id, worker_id, started_at) \
         VALUES ($1, $2, NOW()) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(worker_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record attempt start for task {task_id}"))?;

    Ok(attempt)
}

/// Record the terminal outcome of an execution attempt.
pub async fn record_attempt_finish(
    pool: &PgPool,
    attempt_id: i64,
    success: bool,
    output: Option<&str>,
    error: Option<&str>,
    metadata: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE task_attempts \
         SET completed_at = $1, success = $2, output = $3, error_message = $4, metadata = $5 \
         WHERE id = $6",
    )
    .bind(now)
    .bind(success)
    .bind(output)
    .bind(error)
    .bind(metadata)
    .bind(attempt_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record attempt finish for attempt {attempt_id}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("attempt {attempt_id} not found");
    }

    Ok(())
}

/// All attempts for a task, most recent first.
pub async fn list_attempts_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskAttempt>> {
    let attempts = sqlx::query_as::<_, TaskAttempt>(
        "SELECT * FROM task_attempts WHERE task_id = $1 ORDER BY started_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list attempts for task {task_id}"))?;

    Ok(attempts)
}

/// In-flight attempts (`completed_at IS NULL`) started before `older_than`.
/// Surfaces attempts whose worker died without the executor ever returning
/// and whose owning task hasn't yet been reclaimed by the failure detector.
pub async fn find_stuck_attempts(pool: &PgPool, older_than: DateTime<Utc>) -> Result<Vec<TaskAttempt>> {
    let attempts = sqlx::query_as::<_, TaskAttempt>(
        "SELECT * FROM task_attempts \
         WHERE completed_at IS NULL AND started_at < $1 \
         ORDER BY started_at ASC",
    )
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to find stuck attempts")?;

    Ok(attempts)
}

/// Count attempts recorded in the last `hours` hours, for the metrics view.
pub async fn count_attempts_since(pool: &PgPool, since: DateTime<Utc>) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT \
             COUNT(*) FILTER (WHERE success = true) AS succeeded, \
             COUNT(*) FILTER (WHERE success = false) AS failed \
         FROM task_attempts \
         WHERE started_at >= $1",
    )
    .bind(since)
    .fetch_one(pool)
    .await
    .context("failed to count attempts since cutoff")?;

    Ok(row)
}
