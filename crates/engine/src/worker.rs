//! Single task executor within a foreman's pool.
//!
//! A worker loops: announce itself on the foreman's available channel, wait
//! for a task in its single-slot job channel, run it, mark it complete. The
//! worker exits when either channel is closed by the foreman.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use postroom_queue::{Task, TaskQueue};

use crate::TaskError;
use crate::registry::TaskRegistry;

/// What happened when a task was handed to its handler.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Handler returned `Ok`.
    Completed,
    /// Handler returned an error.
    Failed(TaskError),
    /// Handler panicked; the panic message is kept for logging.
    Panicked(String),
    /// No handler is registered for the task type.
    UnknownType,
}

/// Run `task` through its registered handler.
///
/// The handler runs on its own tokio task so a panic inside it is contained
/// and reported as [`TaskOutcome::Panicked`] instead of unwinding into the
/// caller.
pub async fn execute_task(registry: &TaskRegistry, task: Task) -> TaskOutcome {
    let Some(handler) = registry.get(&task.task_type) else {
        return TaskOutcome::UnknownType;
    };

    let joined = tokio::spawn(async move { handler.handle(&task).await }).await;

    match joined {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(e)) => TaskOutcome::Failed(e),
        Err(e) if e.is_panic() => TaskOutcome::Panicked(panic_message(e.into_panic())),
        Err(e) => TaskOutcome::Panicked(e.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) struct Worker {
    id: usize,
    lane: Arc<str>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    available: mpsc::Sender<usize>,
    job: mpsc::Receiver<Task>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        lane: Arc<str>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
        available: mpsc::Sender<usize>,
        job: mpsc::Receiver<Task>,
    ) -> Self {
        Self {
            id,
            lane,
            queue,
            registry,
            available,
            job,
        }
    }

    pub(crate) fn start(self, tracker: &TaskTracker) {
        tracker.spawn(self.run());
    }

    async fn run(mut self) {
        tracing::debug!(comp = "worker", lane = %self.lane, worker_id = self.id, "Worker started");

        loop {
            // list ourselves as available for work
            if self.available.send(self.id).await.is_err() {
                break;
            }

            // a closed job channel means the foreman is stopping
            let Some(task) = self.job.recv().await else {
                break;
            };

            self.handle_task(task).await;
        }

        tracing::debug!(comp = "worker", lane = %self.lane, worker_id = self.id, "Worker stopped");
    }

    async fn handle_task(&self, task: Task) {
        let task_type = task.task_type.clone();
        let org_id = task.org_id;

        tracing::info!(
            comp = %self.lane,
            worker_id = self.id,
            task_type = %task_type,
            org_id = %org_id,
            "Starting handling of task"
        );
        let start = Instant::now();

        match execute_task(&self.registry, task).await {
            TaskOutcome::Completed => {}
            TaskOutcome::Failed(e) => tracing::error!(
                comp = %self.lane,
                worker_id = self.id,
                task_type = %task_type,
                org_id = %org_id,
                infrastructure = e.is_infrastructure(),
                error = %e,
                "Error running task"
            ),
            TaskOutcome::Panicked(msg) => tracing::error!(
                comp = %self.lane,
                worker_id = self.id,
                task_type = %task_type,
                org_id = %org_id,
                panic = %msg,
                "Panic handling task"
            ),
            TaskOutcome::UnknownType => tracing::error!(
                comp = %self.lane,
                worker_id = self.id,
                task_type = %task_type,
                org_id = %org_id,
                "Unable to find function for task type"
            ),
        }

        // every popped task is marked complete exactly once, whatever the outcome
        if let Err(e) = self.queue.mark_task_complete(&self.lane, org_id).await {
            tracing::error!(
                comp = %self.lane,
                worker_id = self.id,
                org_id = %org_id,
                error = %e,
                "Error marking task complete"
            );
        }

        tracing::info!(
            comp = %self.lane,
            worker_id = self.id,
            task_type = %task_type,
            org_id = %org_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Task complete"
        );
    }
}
