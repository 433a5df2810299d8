//! Database query functions for the `tasks` table.
//!
//! Every mutating query here is either a compare-and-swap (bind the expected
//! `status` into the `WHERE` clause, check `rows_affected()`) or an
//! unconditional terminal write keyed on `id`. `version` is bumped by the
//! statement itself so callers never need a read-modify-write round trip.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus, TaskType};

/// Insert a new task row in `pending` status with `retry_count = 0` and
/// `version = 0`. Returns the inserted row with server-generated defaults.
pub async fn insert_task(
    pool: &PgPool,
    task_type: TaskType,
    payload: &serde_json::Value,
    schedule_at: DateTime<Utc>,
    max_retries: i32,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (type, payload, status, schedule_at, retry_count, max_retries, version) \
         VALUES ($1, $2, 'pending', $3, 0, $4, 0) \
         RETURNING *",
    )
    .bind(task_type)
    .bind(payload)
    .bind(schedule_at)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// All rows with `status = 'pending' AND schedule_at <= now`, ordered by
/// `schedule_at` ascending. Never fails on an empty result.
pub async fn find_due_tasks(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'pending' AND schedule_at <= $1 \
         ORDER BY schedule_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to find due tasks")?;

    Ok(tasks)
}

/// Compare-and-swap claim: PENDING -> RUNNING, assigning `worker_id` and
/// `assigned_at`. Returns `true` iff exactly one row was updated. This is
/// the fundamental atomicity primitive the scheduler relies on.
pub async fn claim(
    pool: &PgPool,
    task_id: Uuid,
    from_status: TaskStatus,
    to_status: TaskStatus,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, worker_id = $2, assigned_at = $3, updated_at = $3, version = version + 1 \
         WHERE id = $4 AND status = $5",
    )
    .bind(to_status)
    .bind(worker_id)
    .bind(now)
    .bind(task_id)
    .bind(from_status)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected() == 1)
}

/// Compare-and-swap status transition with no ownership side effects. Same
/// CAS shape as [`claim`], used for terminal transitions that don't set
/// `worker_id`/`assigned_at`.
pub async fn update_status(
    pool: &PgPool,
    task_id: Uuid,
    from_status: TaskStatus,
    to_status: TaskStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, updated_at = $2, version = version + 1 \
         WHERE id = $3 AND status = $4",
    )
    .bind(to_status)
    .bind(now)
    .bind(task_id)
    .bind(from_status)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    Ok(result.rows_affected() == 1)
}

/// Write terminal fields unconditionally on `id`. Called only after an
/// executor has returned, so no CAS is needed: the coordinator already
/// holds exclusive ownership of the row via its earlier `claim`.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    to_status: TaskStatus,
    completed_at: DateTime<Utc>,
    output: Option<&str>,
    metadata: Option<&serde_json::Value>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, completed_at = $2, execution_output = $3, execution_metadata = $4, \
             updated_at = $2, version = version + 1 \
         WHERE id = $5",
    )
    .bind(to_status)
    .bind(completed_at)
    .bind(output)
    .bind(metadata)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected() == 1)
}

/// Reschedule a task for retry: increment `retry_count`, clear
/// `worker_id`/`assigned_at`, set status (normally back to `pending`) and a
/// new `schedule_at`. Compare-and-swap on `from_status` and the
/// `retry_count` the caller observed when it made the retry decision, so a
/// failure detector reclaim or a newer attempt's write racing this one loses
/// cleanly instead of being stomped. Returns `true` iff exactly one row was
/// updated.
pub async fn increment_retry_and_reschedule(
    pool: &PgPool,
    task_id: Uuid,
    from_status: TaskStatus,
    to_status: TaskStatus,
    expected_retry_count: i32,
    new_schedule_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, retry_count = retry_count + 1, schedule_at = $2, \
             worker_id = NULL, assigned_at = NULL, updated_at = $3, version = version + 1 \
         WHERE id = $4 AND status = $5 AND retry_count = $6",
    )
    .bind(to_status)
    .bind(new_schedule_at)
    .bind(now)
    .bind(task_id)
    .bind(from_status)
    .bind(expected_retry_count)
    .execute(pool)
    .await
    .context("failed to increment retry and reschedule task")?;

    Ok(result.rows_affected() == 1)
}

/// Bulk-reassign every task a given worker owns from `from_status` to
/// `to_status`, clearing ownership. Returns the number of rows affected.
/// Used by the failure detector to reclaim work from dead workers.
pub async fn reset_abandoned(
    pool: &PgPool,
    worker_id: &str,
    from_status: TaskStatus,
    to_status: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, worker_id = NULL, assigned_at = NULL, updated_at = $2, version = version + 1 \
         WHERE worker_id = $3 AND status = $4",
    )
    .bind(to_status)
    .bind(now)
    .bind(worker_id)
    .bind(from_status)
    .execute(pool)
    .await
    .context("failed to reset abandoned tasks")?;

    Ok(result.rows_affected())
}

/// Unconditionally reset every `running` task to `pending`, clearing
/// ownership. Used once at startup by Recovery: worker ids from a previous
/// process are meaningless after restart, so every running row is reset
/// regardless of which worker held it. Returns the number of rows reset.
///
/// Generic over the executor so Recovery can run this inside the same
/// transaction as its heartbeat clear; ordinary callers just pass `&PgPool`.
pub async fn reclaim_all_running<'e, E>(executor: E, now: DateTime<Utc>) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', worker_id = NULL, assigned_at = NULL, updated_at = $1, version = version + 1 \
         WHERE status = 'running'",
    )
    .bind(now)
    .execute(executor)
    .await
    .context("failed to reclaim running tasks at startup")?;

    Ok(result.rows_affected())
}

/// Count tasks in a given status.
pub async fn count_by_status(pool: &PgPool, status: TaskStatus) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = $1")
        .bind(status)
        .fetch_one(pool)
        .await
        .context("failed to count tasks by status")?;

    Ok(row.0)
}

/// All tasks in a given status.
pub async fn find_by_status(pool: &PgPool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = $1")
        .bind(status)
        .fetch_all(pool)
        .await
        .context("failed to find tasks by status")?;

    Ok(tasks)
}

/// All tasks owned by `worker_id` in a given status, ordered by
/// `assigned_at` so a worker drives its own in-flight tasks in the order it
/// claimed them.
pub async fn find_by_worker_and_status(
    pool: &PgPool,
    worker_id: &str,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE worker_id = $1 AND status = $2 \
         ORDER BY assigned_at ASC",
    )
    .bind(worker_id)
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to find tasks by worker and status")?;

    Ok(tasks)
}

/// Tasks in a given status whose `retry_count` has reached or exceeded
/// `max_retries`. Read view backing the retry sweep's correction of rows
/// that transiently violate the retry bound invariant.
pub async fn find_tasks_exceeding_retry_limit(pool: &PgPool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = $1 AND retry_count >= max_retries",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to find tasks exceeding retry limit")?;

    Ok(tasks)
}

/// Status counts across the whole table, for the monitoring view.
#[derive(Debug, Clone, Default)]
pub struct TaskCounts {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts by status, used by the consistency and
/// metrics endpoints.
pub async fn get_task_counts(pool: &PgPool) -> Result<TaskCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt FROM tasks GROUP BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to get task counts")?;

    let mut counts = TaskCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "running" => counts.running = *count,
            "success" => counts.success = *count,
            "failed" => counts.failed = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

/// List tasks with optional status/type filters, paginated.
pub async fn list_tasks(
    pool: &PgPool,
    status: Option<TaskStatus>,
    task_type: Option<TaskType>,
    page: i64,
    page_size: i64,
) -> Result<Vec<Task>> {
    let offset = page.saturating_sub(1).max(0) * page_size;
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1::text) \
           AND ($2::text IS NULL OR type = $2::text) \
         ORDER BY created_at DESC \
         LIMIT $3 OFFSET $4",
    )
    .bind(status.map(|s| s.to_string()))
    .bind(task_type.map(|t| t.to_string()))
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Cancel a task by deleting it, provided it is still `pending`. Returns
/// `true` if a row was removed; `false` means the task was claimed (or
/// otherwise moved on) between the caller's read and this delete.
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected() == 1)
}
