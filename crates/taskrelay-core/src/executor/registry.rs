//! Executor registry -- a collection of executors, selected by task type.
//!
//! The coordinator asks the registry for the first executor whose
//! [`Executor::handles`] accepts a task's type; it never looks anything up
//! by name directly.

use taskrelay_db::models::TaskType;

use super::trait_def::Executor;

/// A collection of registered [`Executor`] implementations.
///
/// # Example
///
/// ```ignore
/// let mut registry = ExecutorRegistry::new();
/// registry.register(DummyExecutor::new());
/// let executor = registry.find(TaskType::Dummy).unwrap();
/// ```
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<Box<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. If a later-registered executor also handles a
    /// type an earlier one does, [`find`] still returns the earlier one.
    ///
    /// [`find`]: ExecutorRegistry::find
    pub fn register(&mut self, executor: impl Executor + 'static) {
        self.executors.push(Box::new(executor));
    }

    /// Find the first registered executor that handles the given task type.
    pub fn find(&self, task_type: TaskType) -> Option<&dyn Executor> {
        self.executors
            .iter()
            .find(|e| e.handles(task_type))
            .map(|b| b.as_ref())
    }

    /// Return the number of registered executors.
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Return `true` if no executors are registered.
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// List the names of all registered executors, in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.executors.iter().map(|e| e.name()).collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.list())
            .finish()
    }
}
