//! The `dummy` executor -- sleeps then echoes a logged message.
//!
//! Exists for exercising the scheduler/worker/coordinator plumbing without
//! any external side effect. Payload shape: `{"sleep_duration_ms": u64,
//! "log_message": string}`. Both fields are optional.

use async_trait::async_trait;
use taskrelay_db::models::{Task, TaskType};

use super::trait_def::{ExecutionResult, Executor, ExecutorError};

#[derive(Debug, Default)]
pub struct DummyExecutor;

impl DummyExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for DummyExecutor {
    fn name(&self) -> &str {
        "dummy"
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Dummy
    }

    async fn execute(&self, task: &Task) -> Result<ExecutionResult, ExecutorError> {
        let sleep_ms = task
            .payload
            .get("sleep_duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let log_message = task
            .payload
            .get("log_message")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if sleep_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        }

        Ok(ExecutionResult::success(log_message))
    }
}
