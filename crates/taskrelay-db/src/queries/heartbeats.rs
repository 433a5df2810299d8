//! Database query functions for the `worker_heartbeats` table.
//!
//! The failure detector reads [`find_stale_workers`] to decide whose
//! `RUNNING` tasks to reclaim; the worker loop writes through
//! [`upsert_heartbeat`] and [`touch_heartbeat`] to stay off that list.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::WorkerHeartbeat;

/// Register a worker, or refresh its row if one already exists under the
/// same id. Bumps `version` either way.
pub async fn upsert_heartbeat(
    pool: &PgPool,
    worker_id: &str,
    now: DateTime<Utc>,
    metadata: Option<&serde_json::Value>,
) -> Result<WorkerHeartbeat> {
    let heartbeat = sqlx::query_as::<_, WorkerHeartbeat>(
        "INSERT INTO worker_heartbeats (worker_id, last_heartbeat, metadata, registered_at, version) \
         VALUES ($1, $2, $3, $2, 0) \
         ON CONFLICT (worker_id) DO UPDATE \
         SET last_heartbeat = $2, metadata = $3, version = worker_heartbeats.version + 1 \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(now)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert heartbeat for worker {worker_id}"))?;

    Ok(heartbeat)
}

/// Refresh `last_heartbeat` for an already-registered worker. Returns the
/// number of rows touched: zero means the row was removed (e.g. garbage
/// collected by the failure detector) and the worker should re-register.
pub async fn touch_heartbeat(pool: &PgPool, worker_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE worker_heartbeats \
         SET last_heartbeat = $1, version = version + 1 \
         WHERE worker_id = $2",
    )
    .bind(now)
    .bind(worker_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to touch heartbeat for worker {worker_id}"))?;

    Ok(result.rows_affected())
}

/// Workers whose last heartbeat predates `cutoff`.
pub async fn find_stale_workers(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>> {
    let workers = sqlx::query_as::<_, WorkerHeartbeat>(
        "SELECT * FROM worker_heartbeats WHERE last_heartbeat < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to find stale workers")?;

    Ok(workers)
}

/// Workers whose last heartbeat is at or after `cutoff`.
pub async fn find_active_workers(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>> {
    let workers = sqlx::query_as::<_, WorkerHeartbeat>(
        "SELECT * FROM worker_heartbeats WHERE last_heartbeat >= $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to find active workers")?;

    Ok(workers)
}

/// Delete heartbeat rows older than `cutoff`, bounding table size. Returns
/// the number of rows removed.
pub async fn cleanup_stale_heartbeats(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM worker_heartbeats WHERE last_heartbeat < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to clean up stale heartbeats")?;

    Ok(result.rows_affected())
}

/// Delete every heartbeat row. Used by tests and by a clean-slate recovery.
///
/// Generic over the executor so Recovery can run this inside the same
/// transaction as its task reclaim; ordinary callers just pass `&PgPool`.
pub async fn delete_all_heartbeats<'e, E>(executor: E) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query("DELETE FROM worker_heartbeats")
        .execute(executor)
        .await
        .context("failed to delete all heartbeats")?;

    Ok(result.rows_affected())
}
