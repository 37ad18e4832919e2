//! Task handlers wiring the planner and sender into the engine.

use async_trait::async_trait;

use postroom_engine::{TaskError, TaskHandler, TaskRegistryBuilder};
use postroom_queue::Task;

use crate::models::{Broadcast, BroadcastBatch};
use crate::planner::BroadcastPlanner;
use crate::sender::BatchSender;
use crate::{SEND_BROADCAST, SEND_BROADCAST_BATCH};

/// Handles `send_broadcast_batch` tasks.
pub struct BatchSendHandler {
    sender: BatchSender,
}

impl BatchSendHandler {
    pub fn new(sender: BatchSender) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl TaskHandler for BatchSendHandler {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        let batch: BroadcastBatch = task.decode()?;
        if batch.org_id != task.org_id {
            return Err(TaskError::Failed(format!(
                "Batch for org {} queued under org {}",
                batch.org_id, task.org_id
            )));
        }

        self.sender.send(&batch).await?;
        Ok(())
    }
}

/// Handles `send_broadcast` tasks: plans the broadcast and queues its batches.
pub struct BroadcastHandler {
    planner: BroadcastPlanner,
}

impl BroadcastHandler {
    pub fn new(planner: BroadcastPlanner) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl TaskHandler for BroadcastHandler {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        let broadcast: Broadcast = task.decode()?;
        if broadcast.org_id != task.org_id {
            return Err(TaskError::Failed(format!(
                "Broadcast for org {} queued under org {}",
                broadcast.org_id, task.org_id
            )));
        }

        self.planner.create_broadcast_batches(&broadcast).await?;
        Ok(())
    }
}

/// Register both broadcast handlers.
pub fn register_handlers(
    builder: TaskRegistryBuilder,
    planner: BroadcastPlanner,
    sender: BatchSender,
) -> TaskRegistryBuilder {
    builder
        .register(SEND_BROADCAST, BroadcastHandler::new(planner))
        .register(SEND_BROADCAST_BATCH, BatchSendHandler::new(sender))
}
