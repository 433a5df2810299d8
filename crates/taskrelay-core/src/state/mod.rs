//! Task status transition graph.
//!
//! The actual compare-and-swap writes live in `taskrelay_db::queries::tasks`
//! (`claim`, `update_status`, `complete_task`, `increment_retry_and_reschedule`);
//! this module only answers "is this edge legal", so callers can assert the
//! shape of what they're about to write before issuing it.

use anyhow::{bail, Result};
use taskrelay_db::models::TaskStatus;

/// The task status transition graph.
///
/// ```text
/// pending -> running            (claim)
/// running -> success            (completeTask)
/// running -> failed             (completeTask, retries exhausted)
/// running -> pending            (incrementRetryAndReschedule, resetAbandoned)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Pending)
        )
    }

    /// Whether `status` is a terminal status. Terminal rows are never
    /// mutated again (I4).
    pub fn is_terminal(status: TaskStatus) -> bool {
        matches!(status, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Assert that `from -> to` is a legal edge before a caller issues the
    /// CAS write for it. A failure here means the caller itself is wrong
    /// about the shape of the write it's about to make, not a concurrency
    /// race -- races are handled by the CAS guard in the query itself.
    pub fn guard(from: TaskStatus, to: TaskStatus) -> Result<()> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            bail!("illegal task state transition: {from} -> {to}");
        }
    }
}
