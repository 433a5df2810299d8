//! The `Executor` trait -- the adapter interface for task runtimes.
//!
//! Each concrete executor (HTTP, shell, dummy) implements this trait. The
//! trait is intentionally object-safe so it can be stored as
//! `Box<dyn Executor>` in the [`super::ExecutorRegistry`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use taskrelay_db::models::{Task, TaskType};

/// Outcome of running a task to completion.
///
/// Success with a `None` output is allowed; a `false` `success` without an
/// `error` string is not meaningful and executors should always set one.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionResult {
    /// A successful outcome, optionally carrying captured output.
    pub fn success(output: Option<String>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// A recoverable-looking failure. The Retry Policy decides whether this
    /// is retried or finalised as `failed`.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(message.into()),
            metadata: HashMap::new(),
        }
    }

    /// Attach metadata to an already-constructed result.
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Error surface for [`Executor::execute`].
///
/// The distinction between variants matters to the coordinator: an
/// `Unrecoverable` signal finalises the task as `failed` without consulting
/// Retry Policy, while any other error is treated the same as
/// [`ExecutionResult::failure`] -- a safe default that hands the task to
/// Retry Policy.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor rejects the task shape outright (e.g. malformed
    /// payload it cannot act on under any retry). Skips Retry Policy.
    #[error("{0}")]
    Unrecoverable(String),

    /// Any other fault raised while running the task.
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

/// Adapter interface for running a claimed task to completion.
///
/// Implementors handle one or more `type` tags and translate the task's
/// `payload` into whatever side effect the type implies (an HTTP call, a
/// subprocess, a logged no-op).
///
/// # Object Safety
///
/// This trait is object-safe: every method either returns a concrete type
/// or an owned value. This means you can store `Box<dyn Executor>` in
/// collections such as [`super::ExecutorRegistry`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable name for this executor (e.g. "http").
    fn name(&self) -> &str;

    /// Whether this executor handles the given task type.
    fn handles(&self, task_type: TaskType) -> bool;

    /// Run the task to completion and report the outcome.
    async fn execute(&self, task: &Task) -> Result<ExecutionResult, ExecutorError>;
}

// Compile-time assertion: Executor must be object-safe.
// If this line compiles, the trait can be used as `dyn Executor`.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskrelay_db::models::TaskStatus;
    use uuid::Uuid;

    /// A trivial executor that always succeeds, used only to prove the
    /// trait can be implemented and used as `dyn Executor`.
    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        fn name(&self) -> &str {
            "noop"
        }

        fn handles(&self, task_type: TaskType) -> bool {
            task_type == TaskType::Dummy
        }

        async fn execute(&self, _task: &Task) -> Result<ExecutionResult, ExecutorError> {
            Ok(ExecutionResult::success(None))
        }
    }

    fn test_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            task_type: TaskType::Dummy,
            payload: serde_json::json!({}),
            status: TaskStatus::Running,
            schedule_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            retry_count: 0,
            max_retries: 0,
            worker_id: Some("w1".to_string()),
            assigned_at: Some(Utc::now()),
            completed_at: None,
            execution_output: None,
            execution_metadata: None,
            version: 0,
        }
    }

    #[test]
    fn executor_is_object_safe() {
        let executor: Box<dyn Executor> = Box::new(NoopExecutor);
        assert_eq!(executor.name(), "noop");
    }

    #[tokio::test]
    async fn noop_executor_succeeds_on_dummy() {
        let executor: Box<dyn Executor> = Box::new(NoopExecutor);
        assert!(executor.handles(TaskType::Dummy));
        assert!(!executor.handles(TaskType::Http));

        let result = executor.execute(&test_task()).await.unwrap();
        assert!(result.success);
        assert!(result.output.is_none());
    }

    #[test]
    fn failure_result_carries_message() {
        let result = ExecutionResult::failure("boom");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }
}
