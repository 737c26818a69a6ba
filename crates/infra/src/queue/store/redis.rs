//! Redis-backed queue store.
//!
//! ## Key layout
//!
//! - **Task hash**: `{prefix}:task:{id}` with fields `task` (JSON), `status`,
//!   `attempts`, `scheduled_at`, `updated_at`, `last_error`, `result`
//! - **Pending**: `{prefix}:pending` sorted set scored by `scheduled_at` micros
//! - **Processing**: `{prefix}:processing` set
//! - **Failed**: `{prefix}:failed` set (dead letters, never purged)
//! - **Completed**: `{prefix}:completed` sorted set scored by completion micros
//!
//! Scores are whole microseconds, which a double holds exactly. Task scores
//! round up and the `dequeue` bound rounds down, so a task is never claimed
//! before its `scheduled_at`.
//!
//! Every state transition is a single Lua script, so the claim made by
//! `dequeue` is atomic on the server even with many pollers. Equal scores
//! fall back to lexicographic member order; ids are UUIDv7 strings, which
//! sort by creation time.
//!
//! Scripts derive task hash keys from the prefix, so on Redis Cluster the
//! prefix must carry a hash tag (e.g. `{taskforge}:queue`).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::instrument;

use taskforge_core::{Task, TaskError, TaskId, TaskRecord, TaskResult, TaskStatus};

use super::{QueueStore, QueueStoreError};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'task', ARGV[2],
  'status', 'pending',
  'attempts', ARGV[3],
  'scheduled_at', ARGV[4],
  'updated_at', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[6], ARGV[1])
return 1
"#;

const DEQUEUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
local key = ARGV[3] .. id
if redis.call('EXISTS', key) == 0 then
  return false
end
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'status', 'processing', 'updated_at', ARGV[2])
redis.call('SADD', KEYS[2], id)
return redis.call('HMGET', key, 'task', 'attempts', 'scheduled_at')
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'completed', 'result', ARGV[2], 'updated_at', ARGV[4])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return 0
end
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[1],
    'status', 'pending',
    'last_error', ARGV[2],
    'updated_at', ARGV[3],
    'scheduled_at', ARGV[5])
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
  redis.call('HSET', KEYS[1], 'status', 'failed', 'last_error', ARGV[2], 'updated_at', ARGV[3])
  redis.call('SADD', KEYS[4], ARGV[1])
end
return 1
"#;

const CLEAR_COMPLETED_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[2] .. id)
  redis.call('ZREM', KEYS[1], id)
end
return #ids
"#;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    complete: Script,
    fail: Script,
    clear_completed: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            clear_completed: Script::new(CLEAR_COMPLETED_SCRIPT),
        }
    }
}

/// Redis-backed queue store.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: MultiplexedConnection,
    prefix: String,
    scripts: std::sync::Arc<Scripts>,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisQueueStore {
    /// Connect to `redis_url` and namespace every key under `prefix`.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, QueueStoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueStoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueStoreError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            scripts: std::sync::Arc::new(Scripts::load()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn task_key_prefix(&self) -> String {
        format!("{}:task:", self.prefix)
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn completed_key(&self) -> String {
        format!("{}:completed", self.prefix)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, task = %task.name), err)]
    async fn enqueue(&self, task: Task) -> Result<(), QueueStoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&task)?;

        let inserted: i64 = self
            .scripts
            .enqueue
            .key(self.task_key(task.id))
            .key(self.pending_key())
            .arg(task.id.to_string())
            .arg(payload)
            .arg(task.attempts)
            .arg(timestamp(task.scheduled_at))
            .arg(timestamp(task.created_at))
            .arg(due_score(task.scheduled_at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("enqueue", e))?;

        if inserted == 0 {
            return Err(QueueStoreError::AlreadyExists(task.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueStoreError> {
        let mut conn = self.conn.clone();

        let claimed: Option<Vec<Option<String>>> = self
            .scripts
            .dequeue
            .key(self.pending_key())
            .key(self.processing_key())
            .arg(now.timestamp_micros())
            .arg(timestamp(now))
            .arg(self.task_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("dequeue", e))?;

        let Some(fields) = claimed else {
            return Ok(None);
        };

        let mut fields = fields.into_iter();
        let (Some(Some(task)), Some(Some(attempts)), Some(Some(scheduled_at))) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(QueueStoreError::Corrupt {
                id: "unknown".to_string(),
                reason: "claimed task hash is missing fields".to_string(),
            });
        };

        let mut task: Task = serde_json::from_str(&task)?;
        apply_mutable_fields(&mut task, &attempts, &scheduled_at)?;
        Ok(Some(task))
    }

    #[instrument(skip(self, result), fields(task_id = %id), err)]
    async fn complete(&self, id: TaskId, result: TaskResult) -> Result<(), QueueStoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&result)?;

        let applied: i64 = self
            .scripts
            .complete
            .key(self.task_key(id))
            .key(self.processing_key())
            .key(self.completed_key())
            .arg(id.to_string())
            .arg(payload)
            .arg(result.completed_at.timestamp_micros())
            .arg(timestamp(result.completed_at))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("complete", e))?;

        if applied == 0 {
            tracing::debug!(task_id = %id, "complete ignored: task unknown or not processing");
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %id, retry = next_attempt_at.is_some()), err)]
    async fn fail(
        &self,
        id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueStoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&error)?;
        let (retry_score, retry_at) = match next_attempt_at {
            Some(at) => (due_score(at).to_string(), timestamp(at)),
            None => (String::new(), String::new()),
        };

        let applied: i64 = self
            .scripts
            .fail
            .key(self.task_key(id))
            .key(self.processing_key())
            .key(self.pending_key())
            .key(self.failed_key())
            .arg(id.to_string())
            .arg(payload)
            .arg(timestamp(error.occurred_at))
            .arg(retry_score)
            .arg(retry_at)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("fail", e))?;

        if applied == 0 {
            tracing::debug!(task_id = %id, "fail ignored: task unknown or not processing");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueStoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.task_key(id))
            .await
            .map_err(|e| map_redis_error("get", e))?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_hash(id, fields).map(Some)
    }

    async fn pending_count(&self) -> Result<u64, QueueStoreError> {
        let mut conn = self.conn.clone();
        conn.zcard(self.pending_key())
            .await
            .map_err(|e| map_redis_error("pending_count", e))
    }

    async fn failed_count(&self) -> Result<u64, QueueStoreError> {
        let mut conn = self.conn.clone();
        conn.scard(self.failed_key())
            .await
            .map_err(|e| map_redis_error("failed_count", e))
    }

    #[instrument(skip(self), err)]
    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        let mut conn = self.conn.clone();
        self.scripts
            .clear_completed
            .key(self.completed_key())
            .arg(before.timestamp_micros())
            .arg(self.task_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("clear_completed", e))
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> QueueStoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        QueueStoreError::Connection(format!("redis unavailable in {operation}: {err}"))
    } else {
        QueueStoreError::Query(format!("redis error in {operation}: {err}"))
    }
}

/// Pending-set score for a task due at `at`: microseconds, rounded up.
fn due_score(at: DateTime<Utc>) -> i64 {
    let micros = at.timestamp_micros();
    if at.timestamp_subsec_nanos() % 1_000 == 0 {
        micros
    } else {
        micros.saturating_add(1)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(id: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, QueueStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueStoreError::Corrupt {
            id: id.to_string(),
            reason: format!("{field}: {e}"),
        })
}

/// `attempts` and `scheduled_at` change after enqueue and live in their own
/// hash fields; the `task` JSON keeps the values from enqueue time.
fn apply_mutable_fields(task: &mut Task, attempts: &str, scheduled_at: &str) -> Result<(), QueueStoreError> {
    let id = task.id.to_string();
    task.attempts = attempts.parse().map_err(|_| QueueStoreError::Corrupt {
        id: id.clone(),
        reason: format!("attempts {attempts:?} is not a number"),
    })?;
    task.scheduled_at = parse_timestamp(&id, "scheduled_at", scheduled_at)?;
    Ok(())
}

fn record_from_hash(id: TaskId, mut fields: HashMap<String, String>) -> Result<TaskRecord, QueueStoreError> {
    let key = id.to_string();
    let mut take = |field: &str| {
        fields.remove(field).ok_or_else(|| QueueStoreError::Corrupt {
            id: key.clone(),
            reason: format!("missing field {field}"),
        })
    };

    let mut task: Task = serde_json::from_str(&take("task")?)?;
    let status: TaskStatus = take("status")?.parse().map_err(|e| QueueStoreError::Corrupt {
        id: key.clone(),
        reason: format!("{e}"),
    })?;
    let attempts = take("attempts")?;
    let scheduled_at = take("scheduled_at")?;
    let updated_at = take("updated_at")?;
    apply_mutable_fields(&mut task, &attempts, &scheduled_at)?;

    let last_error = fields
        .remove("last_error")
        .map(|raw| serde_json::from_str::<TaskError>(&raw))
        .transpose()?;
    let result = fields
        .remove("result")
        .map(|raw| serde_json::from_str::<TaskResult>(&raw))
        .transpose()?;

    Ok(TaskRecord {
        task,
        status,
        last_error,
        result,
        updated_at: parse_timestamp(&key, "updated_at", &updated_at)?,
    })
}
