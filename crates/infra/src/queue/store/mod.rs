//! Queue store boundary.
//!
//! The store exclusively owns persisted task state. Every backend must offer
//! the same contract:
//!
//! - `dequeue(now)` claims the **oldest eligible** pending task
//!   (`scheduled_at <= now`), marks it `processing` and increments
//!   `attempts` in one atomic step. Concurrent callers never receive the
//!   same task.
//! - `complete` / `fail` only act on a task that is currently `processing`.
//!   Unknown ids and tasks in any other state are silently ignored.
//! - `fail` with a `next_attempt_at` puts the task back to `pending` at that
//!   time; without one the task becomes terminally `failed`.
//!
//! Implementations: [`InMemoryQueueStore`] (single process, dev/test),
//! [`PostgresQueueStore`] (`FOR UPDATE SKIP LOCKED` claim) and, behind the
//! `redis` feature, `RedisQueueStore` (Lua-script claim).

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use taskforge_core::{Task, TaskError, TaskId, TaskRecord, TaskResult};

/// Queue store operation error.
///
/// These are infrastructure errors (connectivity, malformed rows). Unknown
/// task ids are not errors for `complete`/`fail`.
#[derive(Debug, Error)]
pub enum QueueStoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt task record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
}

impl From<serde_json::Error> for QueueStoreError {
    fn from(value: serde_json::Error) -> Self {
        QueueStoreError::Serialization(value.to_string())
    }
}

/// Durable (or in-memory) holder of task state.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new task in `pending` state.
    async fn enqueue(&self, task: Task) -> Result<(), QueueStoreError>;

    /// Atomically claim the oldest eligible pending task.
    ///
    /// Returns the task with `attempts` already incremented, or `None` when
    /// nothing is eligible at `now`.
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueStoreError>;

    /// Mark a processing task `completed`.
    async fn complete(&self, id: TaskId, result: TaskResult) -> Result<(), QueueStoreError>;

    /// Record a failure; reschedule when `next_attempt_at` is given, dead-letter otherwise.
    async fn fail(
        &self,
        id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueStoreError>;

    /// Point lookup.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueStoreError>;

    /// Number of tasks in `pending` state (eligible or not).
    async fn pending_count(&self) -> Result<u64, QueueStoreError>;

    /// Number of terminally failed tasks.
    async fn failed_count(&self) -> Result<u64, QueueStoreError>;

    /// Delete completed tasks that completed before `before`; returns how many.
    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueStoreError>;
}

#[async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn enqueue(&self, task: Task) -> Result<(), QueueStoreError> {
        (**self).enqueue(task).await
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueStoreError> {
        (**self).dequeue(now).await
    }

    async fn complete(&self, id: TaskId, result: TaskResult) -> Result<(), QueueStoreError> {
        (**self).complete(id, result).await
    }

    async fn fail(
        &self,
        id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueStoreError> {
        (**self).fail(id, error, next_attempt_at).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueStoreError> {
        (**self).get(id).await
    }

    async fn pending_count(&self) -> Result<u64, QueueStoreError> {
        (**self).pending_count().await
    }

    async fn failed_count(&self) -> Result<u64, QueueStoreError> {
        (**self).failed_count().await
    }

    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        (**self).clear_completed(before).await
    }
}
