//! Broadcast fan-out.
//!
//! A broadcast ("send this message to these groups, contacts and addresses")
//! is planned into batches of recipients, each pushed onto a queue lane as one
//! `send_broadcast_batch` task. Workers then run the [`sender::BatchSender`]
//! on each batch independently.

pub mod handlers;
pub mod models;
pub mod planner;
pub mod render;
pub mod sender;
pub mod store;

use thiserror::Error;

use postroom_common::error::AppError;
use postroom_common::types::Language;
use postroom_engine::TaskError;
use postroom_queue::QueueError;

pub use handlers::{BatchSendHandler, BroadcastHandler, register_handlers};
pub use models::{Broadcast, BroadcastBatch, BroadcastTranslation, Recipient};
pub use planner::{BroadcastPlan, BroadcastPlanner};
pub use sender::BatchSender;

/// Task type of a single batch send.
pub const SEND_BROADCAST_BATCH: &str = "send_broadcast_batch";

/// Task type of a whole broadcast waiting to be planned.
pub const SEND_BROADCAST: &str = "send_broadcast";

/// Default number of recipients per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Planning failures. Structural errors are raised before anything is queued.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Broadcast has no translations")]
    NoTranslations,

    #[error("Broadcast has no translation for its base language '{0}'")]
    MissingBaseTranslation(Language),

    #[error(transparent)]
    Store(#[from] AppError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Batch send failures. Only infrastructure errors end up here; problems with
/// individual recipients are skipped.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<PlanError> for TaskError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Store(e) => TaskError::App(e),
            PlanError::Queue(e) => TaskError::Queue(e),
            other => TaskError::Failed(other.to_string()),
        }
    }
}

impl From<SendError> for TaskError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Store(e) => TaskError::App(e),
        }
    }
}
