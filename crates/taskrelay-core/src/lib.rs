//! Core scheduling engine: executors, retry policy, the execution
//! coordinator, and the scheduler/worker/failure-detector/recovery loops
//! that drive a task from `pending` to a terminal status.
//!
//! Nothing in this crate speaks HTTP or parses CLI arguments -- it only
//! calls through to `taskrelay-db`'s query functions and runs the loops
//! that `taskrelay-cli` wires up and starts.

pub mod coordinator;
pub mod executor;
pub mod failure_detector;
pub mod monitoring;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use executor::{ExecutionResult, Executor, ExecutorError, ExecutorRegistry};

/// Build a registry with the three built-in executors registered.
pub fn default_executor_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(executor::dummy::DummyExecutor::new());
    registry.register(executor::http::HttpExecutor::new());
    registry.register(executor::shell::ShellExecutor::new());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrelay_db::models::TaskType;

    #[test]
    fn default_registry_handles_all_built_in_types() {
        let registry = default_executor_registry();
        assert!(registry.find(TaskType::Dummy).is_some());
        assert!(registry.find(TaskType::Http).is_some());
        assert!(registry.find(TaskType::Shell).is_some());
    }
}
