//! Retry policy: translates a failed execution attempt into either a
//! rescheduled task or a terminal failure.
//!
//! A pure decision function plus the transactional write it commits to, in
//! the spirit of the gate evaluator this is grounded on: look at the task's
//! current counters, decide an action, commit the write for that action.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use taskrelay_db::models::{Task, TaskStatus};
use taskrelay_db::queries::tasks as db;
use uuid::Uuid;

use crate::state::TaskStateMachine;

/// Default backoff base delay: 1 second.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
/// Default backoff ceiling: 5 minutes.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5 * 60 * 1_000;

/// Default retry budget assigned to a task when none is given at creation.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// The action the Retry Policy decided on for a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Rescheduled for another attempt at the given instant.
    Rescheduled,
    /// Retries exhausted; the task has been finalised as `failed`.
    Exhausted,
}

/// Tunables for the Retry Policy's backoff curve and default retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub default_max_retries: i32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Exponential backoff with a ceiling. `attempt` is 0-based: the number of
/// attempts already made before the failure being handled.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let scaled = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    scaled.min(max_ms)
}

/// Decide and commit the outcome for a task whose execution just failed.
///
/// Reads the task's current `retry_count`/`max_retries`, then either:
/// - reschedules it (`incrementRetryAndReschedule` back to `pending`), or
/// - finalises it as `failed` (`updateStatus`) if retries are exhausted.
///
/// Both writes are CAS'd on the `running`/`retry_count` the decision was
/// made from; a caller racing another actor on the same row (a failure
/// detector reclaim, a second attempt's report) simply sees its write affect
/// zero rows, which is not treated as an error here -- the row already moved
/// on.
pub async fn handle_failure(
    pool: &PgPool,
    task_id: Uuid,
    now: DateTime<Utc>,
    config: &RetryConfig,
) -> Result<RetryAction> {
    let task = db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    decide_and_commit(pool, &task, now, config).await
}

async fn decide_and_commit(pool: &PgPool, task: &Task, now: DateTime<Utc>, config: &RetryConfig) -> Result<RetryAction> {
    if task.retry_count < task.max_retries {
        TaskStateMachine::guard(task.status, TaskStatus::Pending)
            .with_context(|| format!("retry policy invoked on task {} in an unexpected state", task.id))?;
        let delay_ms = backoff_delay_ms(task.retry_count as u32, config.base_delay_ms, config.max_delay_ms);
        let new_schedule_at = now + chrono::Duration::milliseconds(delay_ms as i64);

        db::increment_retry_and_reschedule(
            pool,
            task.id,
            TaskStatus::Running,
            TaskStatus::Pending,
            task.retry_count,
            new_schedule_at,
            now,
        )
        .await
        .with_context(|| format!("failed to reschedule task {}", task.id))?;

        Ok(RetryAction::Rescheduled)
    } else {
        TaskStateMachine::guard(task.status, TaskStatus::Failed)
            .with_context(|| format!("retry policy invoked on task {} in an unexpected state", task.id))?;
        db::update_status(pool, task.id, TaskStatus::Running, TaskStatus::Failed, now)
            .await
            .with_context(|| format!("failed to finalise task {} as failed", task.id))?;

        Ok(RetryAction::Exhausted)
    }
}

/// Safety-net sweep: finalise any row whose `retry_count` has exceeded
/// `max_retries` without being caught by the normal failure path (a race
/// artefact per I3). Returns the number of tasks finalised.
pub async fn process_tasks_exceeding_retry_limit(pool: &PgPool, now: DateTime<Utc>) -> Result<usize> {
    let offenders = db::find_tasks_exceeding_retry_limit(pool, TaskStatus::Pending).await?;
    let mut finalised = 0;

    for task in offenders {
        let updated = db::update_status(pool, task.id, TaskStatus::Pending, TaskStatus::Failed, now)
            .await
            .with_context(|| format!("failed to finalise over-limit task {}", task.id))?;
        if updated {
            finalised += 1;
        }
    }

    Ok(finalised)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_ms(0, 1_000, 300_000), 1_000);
        assert_eq!(backoff_delay_ms(1, 1_000, 300_000), 2_000);
        assert_eq!(backoff_delay_ms(2, 1_000, 300_000), 4_000);
        assert_eq!(backoff_delay_ms(3, 1_000, 300_000), 8_000);
    }

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(backoff_delay_ms(20, 1_000, 300_000), 300_000);
    }

    #[test]
    fn backoff_does_not_overflow_on_huge_attempt_counts() {
        let delay = backoff_delay_ms(u32::MAX, 1_000, 300_000);
        assert_eq!(delay, 300_000);
    }
}
