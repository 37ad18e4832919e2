//! Redis-backed task queue.
//!
//! Layout per lane:
//! - `{lane}:active` sorted set of owners scored by tasks in flight
//! - `{lane}:{org_id}` list of JSON encoded tasks for one owner
//!
//! Pops take the head of the list belonging to the lowest scored owner and
//! bump its score; completions decrement it. Both run as Lua scripts so
//! concurrent foremen in several processes see a consistent view. Every push
//! publishes on the `{lane}` channel, which parked foremen subscribe to.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio_stream::StreamExt;

use postroom_common::types::OrgId;

use crate::{QueueError, Task, TaskQueue};

const PUSH_SCRIPT: &str = r#"
-- KEYS[1] active set, KEYS[2] owner list
-- ARGV[1] owner, ARGV[2] task, ARGV[3] lane
redis.call("RPUSH", KEYS[2], ARGV[2])
redis.call("ZINCRBY", KEYS[1], 0, ARGV[1])
redis.call("PUBLISH", ARGV[3], ARGV[1])
"#;

const POP_SCRIPT: &str = r#"
-- KEYS[1] active set
-- ARGV[1] lane
while true do
    local owners = redis.call("ZRANGE", KEYS[1], 0, 0)
    if #owners == 0 then
        return nil
    end

    local owner = owners[1]
    local task = redis.call("LPOP", ARGV[1] .. ":" .. owner)
    if task then
        redis.call("ZINCRBY", KEYS[1], 1, owner)
        return {owner, task}
    end

    -- nothing queued for this owner, drop it and look at the next one
    redis.call("ZREM", KEYS[1], owner)
end
"#;

const COMPLETE_SCRIPT: &str = r#"
-- KEYS[1] active set
-- ARGV[1] owner
local score = redis.call("ZSCORE", KEYS[1], ARGV[1])
if score and tonumber(score) > 0 then
    redis.call("ZINCRBY", KEYS[1], -1, ARGV[1])
end
"#;

const PENDING_SCRIPT: &str = r#"
-- KEYS[1] active set
-- ARGV[1] lane
local owners = redis.call("ZRANGE", KEYS[1], 0, -1)
for _, owner in ipairs(owners) do
    if redis.call("LLEN", ARGV[1] .. ":" .. owner) > 0 then
        return 1
    end
end
return 0
"#;

fn active_key(lane: &str) -> String {
    format!("{}:active", lane)
}

fn owner_key(lane: &str, org_id: OrgId) -> String {
    format!("{}:{}", lane, org_id)
}

/// Task queue stored in Redis.
#[derive(Clone)]
pub struct RedisQueue {
    /// Kept for opening dedicated pub/sub connections.
    client: Client,
    conn: ConnectionManager,
    push_script: Script,
    pop_script: Script,
    complete_script: Script,
    pending_script: Script,
}

impl RedisQueue {
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            push_script: Script::new(PUSH_SCRIPT),
            pop_script: Script::new(POP_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            pending_script: Script::new(PENDING_SCRIPT),
        }
    }

    /// Number of tasks waiting on `lane` for `org_id`.
    pub async fn size(&self, lane: &str, org_id: OrgId) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(owner_key(lane, org_id))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn complete_owner(&self, lane: &str, owner: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = self
            .complete_script
            .key(active_key(lane))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push_task(&self, lane: &str, task: &Task) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();

        let _: () = self
            .push_script
            .key(active_key(lane))
            .key(owner_key(lane, task.org_id))
            .arg(task.org_id.0)
            .arg(encoded)
            .arg(lane)
            .invoke_async(&mut conn)
            .await?;

        tracing::debug!(lane, task_type = %task.task_type, org_id = %task.org_id, "Task pushed");
        Ok(())
    }

    async fn pop_next_task(&self, lane: &str) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = self
            .pop_script
            .key(active_key(lane))
            .arg(lane)
            .invoke_async(&mut conn)
            .await?;

        let Some((owner, raw)) = popped else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                // the pop already counted this task as in flight for its owner
                tracing::error!(lane, owner = %owner, error = %e, "Dropping undecodable task");
                self.complete_owner(lane, &owner).await?;
                Err(e.into())
            }
        }
    }

    async fn mark_task_complete(&self, lane: &str, org_id: OrgId) -> Result<(), QueueError> {
        self.complete_owner(lane, &org_id.to_string()).await
    }

    async fn wait_for_push(&self, lane: &str) -> Result<(), QueueError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(lane).await?;

        // a push published before the subscription started is missed by pub/sub
        let mut conn = self.conn.clone();
        let pending: i64 = self
            .pending_script
            .key(active_key(lane))
            .arg(lane)
            .invoke_async(&mut conn)
            .await?;
        if pending > 0 {
            return Ok(());
        }

        let mut messages = std::pin::pin!(pubsub.on_message());
        match messages.next().await {
            Some(_) => Ok(()),
            None => Err(QueueError::Closed(format!(
                "pub/sub connection for lane {} ended",
                lane
            ))),
        }
    }
}
