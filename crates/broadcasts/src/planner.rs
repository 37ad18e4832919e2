//! Turns one broadcast into queue-ready batches.
//!
//! Planning runs in three steps:
//! 1. Resolve recipients: explicit contacts, then raw addresses (creating
//!    contacts for unknown ones), then group members. The first path to reach
//!    a contact wins; later paths to the same contact are dropped.
//! 2. Drop recipients with nothing deliverable to send to.
//! 3. Pick a lane and split the recipients into batches of at most
//!    `batch_size`.
//!
//! Group sends and anything needing more than one batch go to the bulk lane so
//! they never hold up single replies on the interactive lane.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use postroom_common::types::{ContactId, Urn};
use postroom_queue::{BATCH_QUEUE, HANDLER_QUEUE, Task, TaskQueue};

use crate::models::{Broadcast, BroadcastBatch, Recipient};
use crate::store::ContactStore;
use crate::{DEFAULT_BATCH_SIZE, PlanError, SEND_BROADCAST_BATCH};

/// The outcome of planning a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastPlan {
    pub lane: &'static str,
    pub batches: Vec<BroadcastBatch>,
}

impl BroadcastPlan {
    pub fn recipient_count(&self) -> usize {
        self.batches.iter().map(|b| b.recipients.len()).sum()
    }
}

/// Plans broadcasts and queues their batches.
#[derive(Clone)]
pub struct BroadcastPlanner {
    store: Arc<dyn ContactStore>,
    queue: Arc<dyn TaskQueue>,
    batch_size: usize,
}

impl BroadcastPlanner {
    pub fn new(store: Arc<dyn ContactStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            store,
            queue,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the recipients-per-batch maximum (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Work out the lane and batches for `broadcast` without queueing anything.
    pub async fn plan(&self, broadcast: &Broadcast) -> Result<BroadcastPlan, PlanError> {
        broadcast.validate()?;

        let recipients = self.resolve_recipients(broadcast).await?;
        let lane = choose_lane(!broadcast.group_ids.is_empty(), recipients.len(), self.batch_size);
        let batches = build_batches(broadcast, recipients, self.batch_size);

        Ok(BroadcastPlan { lane, batches })
    }

    /// Plan `broadcast` and push one `send_broadcast_batch` task per batch.
    ///
    /// Every batch is serialized before the first push, so a planning failure
    /// never leaves a partial set of batches queued.
    pub async fn create_broadcast_batches(
        &self,
        broadcast: &Broadcast,
    ) -> Result<BroadcastPlan, PlanError> {
        let plan = self.plan(broadcast).await?;

        let tasks = plan
            .batches
            .iter()
            .map(|batch| Task::new(SEND_BROADCAST_BATCH, broadcast.org_id, batch))
            .collect::<Result<Vec<_>, _>>()?;

        for task in &tasks {
            self.queue.push_task(plan.lane, task).await?;
        }

        tracing::info!(
            org_id = %broadcast.org_id,
            broadcast_id = ?broadcast.broadcast_id,
            lane = plan.lane,
            batches = plan.batches.len(),
            recipients = plan.recipient_count(),
            "Broadcast batches queued"
        );

        Ok(plan)
    }

    async fn resolve_recipients(&self, broadcast: &Broadcast) -> Result<Vec<Recipient>, PlanError> {
        let org_id = broadcast.org_id;
        if broadcast.has_no_targets() {
            tracing::debug!(org_id = %org_id, "Broadcast has no targets");
            return Ok(Vec::new());
        }

        let mut seen: HashSet<ContactId> = HashSet::new();
        let mut recipients = Vec::new();

        for contact_id in &broadcast.contact_ids {
            if seen.insert(*contact_id) {
                recipients.push(Recipient {
                    contact_id: *contact_id,
                    urn: None,
                });
            }
        }

        let (deliverable, undeliverable): (Vec<Urn>, Vec<Urn>) =
            broadcast.urns.iter().cloned().partition(Urn::is_valid);
        for urn in &undeliverable {
            tracing::debug!(org_id = %org_id, urn = %urn, "Skipping undeliverable URN");
        }
        if !deliverable.is_empty() {
            let resolved = self
                .store
                .contact_ids_for_urns(org_id, &deliverable)
                .await?;
            for (urn, contact_id) in resolved {
                if seen.insert(contact_id) {
                    recipients.push(Recipient {
                        contact_id,
                        urn: Some(urn),
                    });
                }
            }
        }

        if !broadcast.group_ids.is_empty() {
            let members = self
                .store
                .group_contact_ids(org_id, &broadcast.group_ids)
                .await?;
            for contact_id in members {
                if seen.insert(contact_id) {
                    recipients.push(Recipient {
                        contact_id,
                        urn: None,
                    });
                }
            }
        }

        // recipients reached by address already have a valid URN to send to
        let to_check: Vec<ContactId> = recipients
            .iter()
            .filter(|r| r.urn.is_none())
            .map(|r| r.contact_id)
            .collect();
        if to_check.is_empty() {
            return Ok(recipients);
        }

        let sendable: HashMap<ContactId, bool> = self
            .store
            .load_contacts(org_id, &to_check)
            .await?
            .into_iter()
            .map(|contact| (contact.id, contact.preferred_urn().is_some()))
            .collect();

        let before = recipients.len();
        recipients.retain(|r| {
            r.urn.is_some() || sendable.get(&r.contact_id).copied().unwrap_or(false)
        });
        if recipients.len() < before {
            tracing::debug!(
                org_id = %org_id,
                dropped = before - recipients.len(),
                "Dropped recipients without a deliverable URN"
            );
        }

        Ok(recipients)
    }
}

/// Bulk if any group is targeted or more than one batch is needed.
pub fn choose_lane(has_groups: bool, recipient_count: usize, batch_size: usize) -> &'static str {
    if has_groups || recipient_count > batch_size {
        BATCH_QUEUE
    } else {
        HANDLER_QUEUE
    }
}

/// Split `recipients` into batches of at most `batch_size`, each carrying the
/// broadcast's full translation set.
pub fn build_batches(
    broadcast: &Broadcast,
    recipients: Vec<Recipient>,
    batch_size: usize,
) -> Vec<BroadcastBatch> {
    let chunks: Vec<&[Recipient]> = recipients.chunks(batch_size.max(1)).collect();
    let count = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| BroadcastBatch {
            org_id: broadcast.org_id,
            broadcast_id: broadcast.broadcast_id,
            translations: broadcast.translations.clone(),
            base_language: broadcast.base_language.clone(),
            recipients: chunk.to_vec(),
            is_last: i + 1 == count,
        })
        .collect()
}
