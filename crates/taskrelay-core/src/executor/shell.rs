//! The `shell` executor -- runs a subprocess described by the task payload.
//!
//! Payload shape: `{"command": string, "args": [string]?, "timeout_secs":
//! u64?}`. `timeout_secs` defaults to 60. A missing `command` is
//! unrecoverable; a non-zero exit or a timeout is a recoverable failure
//! (the process ran, it just didn't succeed).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use taskrelay_db::models::{Task, TaskType};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::trait_def::{ExecutionResult, Executor, ExecutorError};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Shell
    }

    async fn execute(&self, task: &Task) -> Result<ExecutionResult, ExecutorError> {
        let command = task
            .payload
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExecutorError::Unrecoverable("payload missing string field 'command'".to_string()))?;

        let args: Vec<String> = task
            .payload
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let timeout_secs = task
            .payload
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let timeout = Duration::from_secs(timeout_secs.max(1));

        let start = Instant::now();
        let mut child = Command::new(command)
            .args(&args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn shell command {command:?}: {e}"))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        match tokio::time::timeout(timeout, async {
            let (wait_result, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (wait_result, stdout, stderr)
        })
        .await
        {
            Ok((Ok(status), stdout, stderr)) => {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert(
                    "duration_ms".to_string(),
                    serde_json::Value::from(i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)),
                );
                if let Some(code) = status.code() {
                    metadata.insert("exit_code".to_string(), serde_json::Value::from(code));
                }

                if status.success() {
                    Ok(ExecutionResult::success(Some(stdout)).with_metadata(metadata))
                } else {
                    Ok(ExecutionResult::failure(format!(
                        "command exited with {status}: {stderr}"
                    ))
                    .with_metadata(metadata))
                }
            }
            Ok((Err(e), _, _)) => Err(anyhow::anyhow!("failed to wait on shell command {command:?}: {e}").into()),
            Err(_) => {
                let _ = child.kill().await;
                Ok(ExecutionResult::failure(format!(
                    "command {command:?} timed out after {timeout_secs}s"
                )))
            }
        }
    }
}
