//! Failure detector: reclaims work from workers that have stopped sending
//! heartbeats.
//!
//! Has no literal counterpart in the source this is adapted from -- DAG
//! dependencies substitute for liveness there. Shaped on the bulk-CAS
//! pattern `reset_orphaned_tasks` used generalized from "one plan's
//! orphans" to "one worker's abandoned tasks".

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use taskrelay_db::models::TaskStatus;
use taskrelay_db::queries::{heartbeats as heartbeats_db, tasks as tasks_db};
use tokio_util::sync::CancellationToken;

/// Default detection cadence: 30 seconds.
pub const DEFAULT_DETECTION_INTERVAL_MS: u64 = 30_000;
/// Default heartbeat timeout: 60 seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
/// Default stale-heartbeat cleanup horizon: 24 hours.
pub const DEFAULT_CLEANUP_AFTER_MS: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    pub detection_interval_ms: u64,
    pub heartbeat_timeout_ms: i64,
    pub cleanup_after_ms: i64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: DEFAULT_DETECTION_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS as i64,
            cleanup_after_ms: DEFAULT_CLEANUP_AFTER_MS,
        }
    }
}

/// Run one detection pass: reclaim every `running` task owned by a worker
/// whose heartbeat predates the timeout, then trim old heartbeat rows.
/// Returns the number of tasks reassigned.
pub async fn tick(pool: &PgPool, config: &FailureDetectorConfig) -> Result<u64> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::milliseconds(config.heartbeat_timeout_ms);

    let stale = heartbeats_db::find_stale_workers(pool, cutoff)
        .await
        .context("failed to find stale workers")?;

    let mut reassigned = 0;
    for worker in &stale {
        let count = tasks_db::reset_abandoned(
            pool,
            &worker.worker_id,
            TaskStatus::Running,
            TaskStatus::Pending,
            now,
        )
        .await
        .with_context(|| format!("failed to reset abandoned tasks for worker {}", worker.worker_id))?;

        if count > 0 {
            tracing::warn!(worker_id = %worker.worker_id, reassigned = count, "reclaimed tasks from stale worker");
        }
        reassigned += count;
    }

    let cleanup_cutoff = now - chrono::Duration::milliseconds(config.cleanup_after_ms);
    let removed = heartbeats_db::cleanup_stale_heartbeats(pool, cleanup_cutoff)
        .await
        .context("failed to clean up stale heartbeats")?;
    if removed > 0 {
        tracing::debug!(removed, "cleaned up stale heartbeat rows");
    }

    Ok(reassigned)
}

/// Run the failure detector loop until `cancel` fires.
pub async fn run(pool: &PgPool, config: &FailureDetectorConfig, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.detection_interval_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick(pool, config).await {
                    tracing::error!(error = %e, "failure detector tick failed");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("failure detector loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FailureDetectorConfig::default();
        assert_eq!(config.detection_interval_ms, 30_000);
        assert_eq!(config.heartbeat_timeout_ms, 60_000);
        assert_eq!(config.cleanup_after_ms, 24 * 60 * 60 * 1_000);
    }
}
