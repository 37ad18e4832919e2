//! Task dispatch engine.
//!
//! A [`Foreman`] owns a fixed pool of workers bound to one queue lane. It pops
//! tasks from the lane and hands each to an idle worker, which looks up the
//! task's handler in a [`TaskRegistry`], runs it, and reports completion back
//! to the queue.

pub mod foreman;
pub mod registry;
pub mod worker;

use thiserror::Error;

use postroom_common::error::AppError;
use postroom_queue::QueueError;

pub use foreman::{Foreman, ForemanConfig, ForemanHandle};
pub use registry::{FnHandler, TaskHandler, TaskRegistry, TaskRegistryBuilder, handler_fn};
pub use worker::{TaskOutcome, execute_task};

/// Failure reported by a task handler.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Invalid task payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Whether the task failed because a backend was unavailable rather than
    /// because of its own data.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            TaskError::App(e) => e.is_infrastructure(),
            TaskError::Queue(_) => true,
            TaskError::Decode(_) | TaskError::Failed(_) => false,
        }
    }
}
