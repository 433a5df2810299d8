//! Execution coordinator: runs a single claimed task through its executor
//! from attempt-start to terminal commit.
//!
//! Staged like the agent lifecycle this is grounded on -- record an
//! in-flight attempt, look up the capability that can run the task, invoke
//! it, then commit the outcome -- but with the DAG/worktree/gate-specific
//! steps stripped out: there is no dependency graph here, so nothing to
//! check before running, and the terminal write is a single `completeTask`
//! call instead of a multi-stage gate evaluation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use taskrelay_db::models::{Task, TaskStatus};
use taskrelay_db::queries::{attempts as attempts_db, tasks as tasks_db};
use sqlx::PgPool;

use crate::executor::{ExecutionResult, ExecutorError, ExecutorRegistry};
use crate::state::TaskStateMachine;

/// Outcome of running a task through the coordinator. The Worker Loop uses
/// this to decide whether to invoke Retry Policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorOutcome {
    /// The executor succeeded; the task is now `success`.
    Success,
    /// No executor handles the task's type; the task is now `failed`,
    /// Retry Policy was not consulted.
    NoExecutor,
    /// The executor raised an unrecoverable signal; the task is now
    /// `failed`, Retry Policy was not consulted.
    Unrecoverable,
    /// The executor reported a recoverable failure, or an unexpected fault
    /// occurred; the task is still `running` and the caller must invoke
    /// Retry Policy.
    RecoverableFailure,
}

/// Drive a single claimed task through its executor and commit the result.
///
/// `task` must already be `running` and owned by `worker_id` (the caller's
/// earlier `claim` succeeded). This function does not re-check ownership;
/// it trusts the caller's claim.
pub async fn run(
    pool: &PgPool,
    registry: &ExecutorRegistry,
    task: &Task,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<CoordinatorOutcome> {
    let attempt = attempts_db::record_attempt_start(pool, task.id, worker_id)
        .await
        .with_context(|| format!("failed to record attempt start for task {}", task.id))?;

    let Some(executor) = registry.find(task.task_type) else {
        TaskStateMachine::guard(task.status, TaskStatus::Failed)
            .with_context(|| format!("coordinator invoked on task {} in an unexpected state", task.id))?;
        let message = format!("no executor for type {}", task.task_type);
        finish_attempt(pool, attempt.id, false, None, Some(&message), now).await?;
        tasks_db::complete_task(pool, task.id, TaskStatus::Failed, now, None, None)
            .await
            .with_context(|| format!("failed to complete task {} as failed", task.id))?;
        return Ok(CoordinatorOutcome::NoExecutor);
    };

    match executor.execute(task).await {
        Ok(ExecutionResult {
            success: true,
            output,
            metadata,
            ..
        }) => {
            TaskStateMachine::guard(task.status, TaskStatus::Success)
                .with_context(|| format!("coordinator invoked on task {} in an unexpected state", task.id))?;
            let metadata_json = metadata_to_json(&metadata);
            finish_attempt(pool, attempt.id, true, output.as_deref(), None, now).await?;
            tasks_db::complete_task(
                pool,
                task.id,
                TaskStatus::Success,
                now,
                output.as_deref(),
                metadata_json.as_ref(),
            )
            .await
            .with_context(|| format!("failed to complete task {} as success", task.id))?;
            Ok(CoordinatorOutcome::Success)
        }
        Ok(ExecutionResult {
            success: false,
            error,
            ..
        }) => {
            let message = error.unwrap_or_else(|| "executor reported failure".to_string());
            finish_attempt(pool, attempt.id, false, None, Some(&message), now).await?;
            Ok(CoordinatorOutcome::RecoverableFailure)
        }
        Err(ExecutorError::Unrecoverable(message)) => {
            TaskStateMachine::guard(task.status, TaskStatus::Failed)
                .with_context(|| format!("coordinator invoked on task {} in an unexpected state", task.id))?;
            finish_attempt(pool, attempt.id, false, None, Some(&message), now).await?;
            tasks_db::complete_task(pool, task.id, TaskStatus::Failed, now, None, None)
                .await
                .with_context(|| format!("failed to complete task {} as failed", task.id))?;
            Ok(CoordinatorOutcome::Unrecoverable)
        }
        Err(ExecutorError::Fault(e)) => {
            let message = format!("unexpected executor fault: {e}");
            finish_attempt(pool, attempt.id, false, None, Some(&message), now).await?;
            Ok(CoordinatorOutcome::RecoverableFailure)
        }
    }
}

async fn finish_attempt(
    pool: &PgPool,
    attempt_id: i64,
    success: bool,
    output: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    attempts_db::record_attempt_finish(pool, attempt_id, success, output, error, None, now)
        .await
        .with_context(|| format!("failed to record attempt finish for attempt {attempt_id}"))
}

fn metadata_to_json(
    metadata: &std::collections::HashMap<String, serde_json::Value>,
) -> Option<serde_json::Value> {
    if metadata.is_empty() {
        None
    } else {
        Some(serde_json::to_value(metadata).unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_to_json_empty_is_none() {
        assert!(metadata_to_json(&std::collections::HashMap::new()).is_none());
    }

    #[test]
    fn metadata_to_json_nonempty_serializes() {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("k".to_string(), serde_json::json!("v"));
        let json = metadata_to_json(&metadata).unwrap();
        assert_eq!(json["k"], serde_json::json!("v"));
    }
}
