//! Task handler registry.
//!
//! Maps a task type to the handler that executes it. The registry is built
//! once at startup, before any foreman starts, and shared read-only between
//! every worker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use postroom_queue::Task;

use crate::TaskError;

/// Trait that all task handlers must implement.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute a task. Errors are logged by the worker; the task is never retried.
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` so it can be registered as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        (self.0)(task.clone()).await
    }
}

/// Immutable mapping of task type → handler.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    /// Look up the handler for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// All registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

/// Collects handlers before freezing them into a [`TaskRegistry`].
#[derive(Default)]
pub struct TaskRegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistryBuilder {
    /// Register `handler` for `task_type`. A later registration for the same
    /// type replaces the earlier one.
    pub fn register(
        mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Self {
        let task_type = task_type.into();
        if self
            .handlers
            .insert(task_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "Task handler registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            handlers: self.handlers,
        }
    }
}
