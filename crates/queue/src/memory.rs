//! In-process task queue.
//!
//! Per lane, tasks are kept in one FIFO per owner. A pop hands out the head
//! task of the owner with the fewest tasks in flight; ties go to the owner
//! that has waited longest since its last pop. Wake notifications are a
//! `watch` channel per lane bumped on every push.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use postroom_common::types::OrgId;

use crate::{QueueError, Task, TaskQueue};

#[derive(Debug)]
struct LaneState {
    queued: HashMap<OrgId, VecDeque<Task>>,
    in_flight: HashMap<OrgId, usize>,
    /// Owners in the order they should be preferred on a tie.
    rotation: VecDeque<OrgId>,
    wake: watch::Sender<u64>,
}

impl LaneState {
    fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            queued: HashMap::new(),
            in_flight: HashMap::new(),
            rotation: VecDeque::new(),
            wake,
        }
    }

    fn push(&mut self, task: Task) {
        let org_id = task.org_id;
        self.queued.entry(org_id).or_default().push_back(task);
        if !self.rotation.contains(&org_id) {
            self.rotation.push_back(org_id);
        }
        self.wake.send_modify(|pushes| *pushes += 1);
    }

    fn pop(&mut self) -> Option<Task> {
        let (position, org_id) = self
            .rotation
            .iter()
            .enumerate()
            .filter(|(_, org)| self.queued.get(*org).is_some_and(|q| !q.is_empty()))
            .min_by_key(|(position, org)| {
                (self.in_flight.get(*org).copied().unwrap_or(0), *position)
            })
            .map(|(position, org)| (position, *org))?;

        let queue = self.queued.get_mut(&org_id)?;
        let task = queue.pop_front()?;
        if queue.is_empty() {
            self.queued.remove(&org_id);
        }

        // Move the owner to the back so its peers get the next tie.
        self.rotation.remove(position);
        self.rotation.push_back(org_id);

        *self.in_flight.entry(org_id).or_insert(0) += 1;
        Some(task)
    }

    fn complete(&mut self, org_id: OrgId) {
        if let Some(count) = self.in_flight.get_mut(&org_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(&org_id);
            }
        }
        if !self.queued.contains_key(&org_id) && !self.in_flight.contains_key(&org_id) {
            self.rotation.retain(|org| *org != org_id);
        }
    }
}

/// A task queue held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    lanes: Mutex<HashMap<String, LaneState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lane<R>(
        &self,
        lane: &str,
        f: impl FnOnce(&mut LaneState) -> R,
    ) -> Result<R, QueueError> {
        let mut lanes = self
            .lanes
            .lock()
            .map_err(|_| QueueError::Closed("memory queue lock poisoned".to_string()))?;
        let state = lanes
            .entry(lane.to_string())
            .or_insert_with(LaneState::new);
        Ok(f(state))
    }

    /// Number of tasks waiting on `lane`.
    pub fn size(&self, lane: &str) -> usize {
        self.with_lane(lane, |state| state.queued.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Number of tasks popped for `org_id` on `lane` and not yet completed.
    pub fn in_flight(&self, lane: &str, org_id: OrgId) -> usize {
        self.with_lane(lane, |state| state.in_flight.get(&org_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push_task(&self, lane: &str, task: &Task) -> Result<(), QueueError> {
        self.with_lane(lane, |state| state.push(task.clone()))?;
        tracing::debug!(lane, task_type = %task.task_type, org_id = %task.org_id, "Task pushed");
        Ok(())
    }

    async fn pop_next_task(&self, lane: &str) -> Result<Option<Task>, QueueError> {
        self.with_lane(lane, LaneState::pop)
    }

    async fn mark_task_complete(&self, lane: &str, org_id: OrgId) -> Result<(), QueueError> {
        self.with_lane(lane, |state| state.complete(org_id))
    }

    async fn wait_for_push(&self, lane: &str) -> Result<(), QueueError> {
        // A push can land between the caller's empty pop and this call, so only
        // wait when the lane is still empty.
        let wake = self.with_lane(lane, |state| {
            state.queued.is_empty().then(|| state.wake.subscribe())
        })?;
        let Some(mut wake) = wake else {
            return Ok(());
        };
        wake.changed()
            .await
            .map_err(|_| QueueError::Closed(format!("wake channel for lane {} dropped", lane)))
    }
}
