//! Task queue contract shared by producers (the broadcast planner) and
//! consumers (foremen).
//!
//! A queue is split into named lanes. Each lane holds tasks per owner (an
//! org); the backend decides which owner's task is popped next and uses
//! [`TaskQueue::mark_task_complete`] to track how many tasks each owner has in
//! flight. Callers must report completion exactly once for every popped task.
//!
//! Two backends are provided:
//! - [`memory::MemoryQueue`] for tests and single-process setups
//! - [`redis_queue::RedisQueue`] for production

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use postroom_common::types::OrgId;

/// Lane for latency-sensitive work (single replies, small broadcasts).
pub const HANDLER_QUEUE: &str = "handler";

/// Lane for bulk work (group broadcasts, large fan-outs).
pub const BATCH_QUEUE: &str = "batch";

/// Errors surfaced by a queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue closed: {0}")]
    Closed(String),
}

/// A typed, owner-tagged unit of work.
///
/// The payload is opaque to the queue and to the engine; only the handler
/// registered for `task_type` knows how to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: String,
    pub org_id: OrgId,
    pub task: serde_json::Value,
}

impl Task {
    /// Build a task by serializing `payload`.
    pub fn new<T: Serialize>(
        task_type: impl Into<String>,
        org_id: OrgId,
        payload: &T,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            task_type: task_type.into(),
            org_id,
            task: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into the handler's own type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.task)
    }
}

/// Access contract for a multi-tenant, multi-lane task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task to `lane` and notify anything parked on the lane.
    async fn push_task(&self, lane: &str, task: &Task) -> Result<(), QueueError>;

    /// Pop the next eligible task for `lane`. Never blocks; `None` means the
    /// lane currently has nothing to hand out.
    async fn pop_next_task(&self, lane: &str) -> Result<Option<Task>, QueueError>;

    /// Record that a task popped for `org_id` on `lane` has finished.
    async fn mark_task_complete(&self, lane: &str, org_id: OrgId) -> Result<(), QueueError>;

    /// Resolve on the next push notification for `lane`.
    ///
    /// Delivery is best effort: a push racing with the subscription may be
    /// missed, so callers always bound this with a timeout.
    async fn wait_for_push(&self, lane: &str) -> Result<(), QueueError>;
}
