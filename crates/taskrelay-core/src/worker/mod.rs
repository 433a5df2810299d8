//! Worker loop: the per-process actor that drives its own claimed tasks to
//! completion and keeps a heartbeat alive so the Failure Detector leaves it
//! alone.
//!
//! Two independently-ticking subtasks share one worker id, following the
//! orchestrator's tick-and-select shape: a heartbeat subtask that just
//! keeps a row fresh, and a processing subtask that hands claimed work to
//! the Execution Coordinator.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use taskrelay_db::models::TaskStatus;
use taskrelay_db::queries::{heartbeats as heartbeats_db, tasks as tasks_db};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{self, CoordinatorOutcome};
use crate::executor::ExecutorRegistry;
use crate::retry::{self, RetryConfig};

/// Default heartbeat cadence: 30 seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Default processing cadence: 1 second.
pub const DEFAULT_PROCESSING_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat_interval_ms: u64,
    pub processing_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            processing_interval_ms: DEFAULT_PROCESSING_INTERVAL_MS,
        }
    }
}

/// Derive a worker id from the host name and a short random suffix.
pub fn derive_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix: u32 = rand::random();
    format!("{host}-{suffix:08x}")
}

/// Run the worker loop until `cancel` fires.
///
/// Registers the worker via `upsertHeartbeat` before starting either
/// subtask. Outstanding in-flight attempts at shutdown are left for the
/// next process's Recovery sweep to pick up -- this function does not try
/// to finish work in progress.
pub async fn run(
    pool: &PgPool,
    registry: &ExecutorRegistry,
    config: &WorkerConfig,
    retry_config: &RetryConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let worker_id = derive_worker_id();
    heartbeats_db::upsert_heartbeat(pool, &worker_id, Utc::now(), None).await?;
    tracing::info!(worker_id = %worker_id, "worker registered");

    tokio::join!(
        heartbeat_loop(pool, &worker_id, config.heartbeat_interval_ms, cancel.clone()),
        processing_loop(pool, registry, &worker_id, config.processing_interval_ms, retry_config, cancel.clone()),
    );

    tracing::info!(worker_id = %worker_id, "worker loop shut down");
    Ok(())
}

async fn heartbeat_loop(pool: &PgPool, worker_id: &str, interval_ms: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match heartbeats_db::touch_heartbeat(pool, worker_id, Utc::now()).await {
                    Ok(0) => {
                        tracing::warn!(worker_id = %worker_id, "heartbeat row missing, re-registering");
                        if let Err(e) = heartbeats_db::upsert_heartbeat(pool, worker_id, Utc::now(), None).await {
                            tracing::error!(worker_id = %worker_id, error = %e, "failed to re-register heartbeat");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "failed to touch heartbeat"),
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn processing_loop(
    pool: &PgPool,
    registry: &ExecutorRegistry,
    worker_id: &str,
    interval_ms: u64,
    retry_config: &RetryConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = process_once(pool, registry, worker_id, retry_config).await {
                    tracing::error!(worker_id = %worker_id, error = %e, "worker processing tick failed");
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Drive every `running` task owned by this worker through the coordinator,
/// sequentially in `assigned_at` order.
async fn process_once(
    pool: &PgPool,
    registry: &ExecutorRegistry,
    worker_id: &str,
    retry_config: &RetryConfig,
) -> anyhow::Result<()> {
    let tasks = tasks_db::find_by_worker_and_status(pool, worker_id, TaskStatus::Running).await?;

    for task in tasks {
        let now = Utc::now();
        match coordinator::run(pool, registry, &task, worker_id, now).await {
            Ok(CoordinatorOutcome::RecoverableFailure) => {
                if let Err(e) = retry::handle_failure(pool, task.id, now, retry_config).await {
                    tracing::error!(task_id = %task.id, error = %e, "retry policy failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "coordinator failed to run task");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_include_suffix_and_are_unique() {
        let a = derive_worker_id();
        let b = derive_worker_id();
        assert_ne!(a, b);
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.processing_interval_ms, 1_000);
    }
}
