//! Startup recovery: clean up state left behind by a previous process
//! before any loop starts.
//!
//! No literal counterpart either -- the nearest shape is the orphan-reset
//! pass at the top of the orchestrator's main loop, generalized here to run
//! once, globally, at process start rather than per plan run.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use taskrelay_db::{pool, queries::{heartbeats as heartbeats_db, tasks as tasks_db}};

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Tasks reset from `running` to `pending`.
    pub reclaimed_tasks: u64,
    /// Heartbeat rows discarded.
    pub cleared_heartbeats: u64,
}

/// Run the full recovery sequence. Must run exactly once, before the
/// Scheduler Loop, Worker Loop, or Failure Detector start.
///
/// 1. Validate the store is reachable (a trivial count per table).
/// 2. Reset every `running` task to `pending`, clearing ownership --
///    worker ids from the previous process are meaningless after restart --
///    and delete every heartbeat row to start the registry clean, both
///    within one transaction so a crash mid-recovery can't leave stale
///    heartbeats for tasks that were already reclaimed.
pub async fn run(pool: &PgPool) -> Result<RecoveryReport> {
    pool::table_counts(pool)
        .await
        .context("store is unreachable at startup")?;

    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin recovery transaction")?;

    let reclaimed_tasks = tasks_db::reclaim_all_running(&mut *tx, now)
        .await
        .context("failed to reclaim running tasks at startup")?;
    if reclaimed_tasks > 0 {
        tracing::warn!(reclaimed_tasks, "reset running tasks left by a previous process");
    }

    let cleared_heartbeats = heartbeats_db::delete_all_heartbeats(&mut *tx)
        .await
        .context("failed to clear heartbeats at startup")?;

    tx.commit().await.context("failed to commit recovery transaction")?;

    Ok(RecoveryReport {
        reclaimed_tasks,
        cleared_heartbeats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_report_is_zeroed() {
        let report = RecoveryReport::default();
        assert_eq!(report.reclaimed_tasks, 0);
        assert_eq!(report.cleared_heartbeats, 0);
    }
}
