//! Scheduler loop: the single logical actor that claims due tasks for
//! workers.
//!
//! Ticks on a fixed cadence, grounded on the orchestrator's tick-and-select
//! shape but stripped down to its essentials: no DAG readiness check, no
//! semaphore, no in-flight bookkeeping -- claiming a task here just hands
//! it off to whichever worker's poll loop notices it next.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use taskrelay_db::models::TaskStatus;
use taskrelay_db::queries::{heartbeats as heartbeats_db, tasks as db};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state::TaskStateMachine;

/// Default tick cadence: 1 second.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

/// Generate a synthetic worker id for a single claim.
///
/// The contract only requires `worker_id` to be a valid string that one
/// and only one worker's poll loop will pick up; a production deployment
/// may instead sample from `findActiveWorkers` and hand the claim to a
/// real worker. This is the source's synthetic-id strategy.
fn fresh_worker_assignment() -> String {
    format!("scheduler-{}", Uuid::new_v4().simple())
}

/// Run one scheduling tick: claim every currently-due task. Returns the
/// number of tasks successfully claimed.
pub async fn tick(pool: &PgPool) -> Result<usize> {
    let now = Utc::now();
    let due = db::find_due_tasks(pool, now).await.context("failed to find due tasks")?;

    let mut claimed = 0;
    for task in due {
        TaskStateMachine::guard(TaskStatus::Pending, TaskStatus::Running)
            .with_context(|| format!("scheduler tried to claim task {} out of an illegal edge", task.id))?;
        let worker_id = fresh_worker_assignment();
        // A false return means another scheduler won the race; normal.
        if db::claim(pool, task.id, TaskStatus::Pending, TaskStatus::Running, &worker_id, now).await? {
            claimed += 1;
            // The synthetic id has no worker loop to refresh it, so record a
            // heartbeat stamped at claim time: it immediately starts aging
            // and the Failure Detector reclaims the task once it crosses
            // heartbeat_timeout, exactly as it would for a dead real worker.
            heartbeats_db::upsert_heartbeat(pool, &worker_id, now, None)
                .await
                .with_context(|| format!("failed to record synthetic heartbeat for {worker_id}"))?;
        }
    }

    Ok(claimed)
}

/// Run the scheduler loop until `cancel` fires.
pub async fn run(pool: &PgPool, config: &SchedulerConfig, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match tick(pool).await {
                    Ok(claimed) if claimed > 0 => {
                        tracing::debug!(claimed, "scheduler tick claimed tasks");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("scheduler loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_interval_is_one_second() {
        assert_eq!(SchedulerConfig::default().tick_interval_ms, 1_000);
    }

    #[test]
    fn synthetic_worker_ids_are_unique() {
        let a = fresh_worker_assignment();
        let b = fresh_worker_assignment();
        assert_ne!(a, b);
        assert!(a.starts_with("scheduler-"));
    }
}
