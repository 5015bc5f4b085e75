//! Job queue (C9): typed tasks, at-least-once delivery, bounded retries,
//! dead-lettering. Built directly on the same Redis connection used for the
//! rate limiter and token blacklist (spec §6: "share a single external
//! key-value store"), since no crate in the dependency pack offers a queue
//! and hand-rolling one on top of Redis's list/sorted-set primitives keeps
//! the stack minimal.
//!
//! Layout per queue name:
//!   `queue:{name}`            — list of pending task ids (FIFO via RPUSH/LPOP)
//!   `queue:{name}:task:{id}`  — hash of the task's serialized fields
//!   `queue:{name}:inflight`   — sorted set, id → deadline unix timestamp
//!   `queue:{name}:dead`       — list of task ids that exhausted their retries
//!
//! A task is at-least-once: a worker that crashes after dequeue but before
//! ack leaves its id in `inflight` past its deadline; the reaper task
//! requeues it (spec §4.10 "uncompleted handlers are returned to the queue").

pub mod worker;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chrono::Utc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub attempt: u32,
}

pub struct QueueDefaults {
    pub max_retries: u32,
    pub timeout_secs: u64,
}

pub const SCAN_QUEUE: &str = "scan";
pub const TRANSCODE_QUEUE: &str = "transcode";

pub fn defaults_for(queue_name: &str) -> QueueDefaults {
    match queue_name {
        SCAN_QUEUE => QueueDefaults {
            max_retries: 2,
            timeout_secs: 2 * 60,
        },
        TRANSCODE_QUEUE => QueueDefaults {
            max_retries: 3,
            timeout_secs: 5 * 60,
        },
        _ => QueueDefaults {
            max_retries: 1,
            timeout_secs: 60,
        },
    }
}

fn task_key(queue_name: &str, id: &str) -> String {
    format!("queue:{queue_name}:task:{id}")
}

fn pending_key(queue_name: &str) -> String {
    format!("queue:{queue_name}")
}

fn inflight_key(queue_name: &str) -> String {
    format!("queue:{queue_name}:inflight")
}

fn dead_key(queue_name: &str) -> String {
    format!("queue:{queue_name}:dead")
}

pub async fn enqueue(
    redis: &mut ConnectionManager,
    queue_name: &str,
    task_type: &str,
    payload: serde_json::Value,
) -> redis::RedisResult<String> {
    let defaults = defaults_for(queue_name);
    let task = Task {
        id: Uuid::new_v4().to_string(),
        task_type: task_type.to_string(),
        payload,
        max_retries: defaults.max_retries,
        timeout_secs: defaults.timeout_secs,
        attempt: 0,
    };

    let serialized = serde_json::to_string(&task).expect("Task serializes");
    redis.set(task_key(queue_name, &task.id), serialized).await?;
    redis.rpush(pending_key(queue_name), &task.id).await?;
    Ok(task.id)
}

/// Pops the next task id off the pending list (non-blocking; the worker
/// loop is responsible for idling between empty polls) and marks it
/// in-flight with a deadline `timeout_secs` from now.
pub async fn dequeue(redis: &mut ConnectionManager, queue_name: &str) -> redis::RedisResult<Option<Task>> {
    let id: Option<String> = redis.lpop(pending_key(queue_name), None).await?;
    let Some(id) = id else {
        return Ok(None);
    };

    let raw: Option<String> = redis.get(task_key(queue_name, &id)).await?;
    let Some(raw) = raw else {
        // Task hash expired or was deleted out from under us; drop the id.
        return Ok(None);
    };
    let task: Task = serde_json::from_str(&raw).expect("stored task is valid JSON");

    let deadline = Utc::now().timestamp() + task.timeout_secs as i64;
    redis.zadd(inflight_key(queue_name), &id, deadline).await?;

    Ok(Some(task))
}

/// Acknowledges successful completion: removes the task from `inflight` and
/// deletes its stored fields.
pub async fn ack(redis: &mut ConnectionManager, queue_name: &str, task_id: &str) -> redis::RedisResult<()> {
    redis.zrem(inflight_key(queue_name), task_id).await?;
    redis.del(task_key(queue_name, task_id)).await?;
    Ok(())
}

/// Reports a failed attempt. If retries remain, the task is requeued with
/// an incremented attempt counter; otherwise it's moved to the dead-letter
/// list and removed from `inflight`.
pub async fn fail(redis: &mut ConnectionManager, queue_name: &str, mut task: Task) -> redis::RedisResult<()> {
    redis.zrem(inflight_key(queue_name), &task.id).await?;
    task.attempt += 1;

    if task.attempt > task.max_retries {
        redis.del(task_key(queue_name, &task.id)).await?;
        redis.rpush(dead_key(queue_name), &task.id).await?;
        tracing::error!(task_id = %task.id, task_type = %task.task_type, "task moved to dead-letter after exhausting retries");
        return Ok(());
    }

    let serialized = serde_json::to_string(&task).expect("Task serializes");
    redis.set(task_key(queue_name, &task.id), serialized).await?;
    redis.rpush(pending_key(queue_name), &task.id).await?;
    Ok(())
}

/// Requeues any in-flight task whose deadline has passed without an ack —
/// the crashed-worker recovery path. Returns the number of tasks recovered.
/// Called periodically by the reaper (spec §4.13).
pub async fn reclaim_expired(redis: &mut ConnectionManager, queue_name: &str) -> redis::RedisResult<u64> {
    let now = Utc::now().timestamp();
    let expired: Vec<String> = redis
        .zrangebyscore(inflight_key(queue_name), 0, now)
        .await?;

    let mut recovered = 0u64;
    for id in expired {
        let raw: Option<String> = redis.get(task_key(queue_name, &id)).await?;
        redis.zrem(inflight_key(queue_name), &id).await?;
        let Some(raw) = raw else { continue };
        let task: Task = serde_json::from_str(&raw).expect("stored task is valid JSON");
        fail(redis, queue_name, task).await?;
        recovered += 1;
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_and_transcode_carry_the_documented_defaults() {
        let scan = defaults_for(SCAN_QUEUE);
        assert_eq!(scan.max_retries, 2);
        assert_eq!(scan.timeout_secs, 120);

        let transcode = defaults_for(TRANSCODE_QUEUE);
        assert_eq!(transcode.max_retries, 3);
        assert_eq!(transcode.timeout_secs, 300);
    }
}
