//! The `http` executor -- issues a single HTTP request described by the
//! task payload.
//!
//! Payload shape: `{"method": string, "url": string, "headers": object?,
//! "body": string?, "timeout_secs": u64?}`. `method` defaults to `"GET"`,
//! `timeout_secs` defaults to 30. A non-2xx response is reported as a
//! recoverable failure; a malformed payload (missing/invalid `url`) is
//! unrecoverable since no amount of retrying fixes it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use taskrelay_db::models::{Task, TaskType};

use super::trait_def::{ExecutionResult, Executor, ExecutorError};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Http
    }

    async fn execute(&self, task: &Task) -> Result<ExecutionResult, ExecutorError> {
        let url = task
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExecutorError::Unrecoverable("payload missing string field 'url'".to_string()))?;

        let method = task
            .payload
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| ExecutorError::Unrecoverable(format!("invalid HTTP method {method:?}")))?;

        let timeout_secs = task
            .payload
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut request = self
            .client
            .request(method, url)
            .timeout(Duration::from_secs(timeout_secs));

        if let Some(headers) = task.payload.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }

        if let Some(body) = task.payload.get("body").and_then(|v| v.as_str()) {
            request = request.body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("http request failed: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read response body: {e}"))?;

        let mut metadata = HashMap::new();
        metadata.insert(
            "status_code".to_string(),
            serde_json::Value::from(status.as_u16()),
        );

        if status.is_success() {
            Ok(ExecutionResult::success(Some(body)).with_metadata(metadata))
        } else {
            Ok(ExecutionResult::failure(format!("http status {status}")).with_metadata(metadata))
        }
    }
}
