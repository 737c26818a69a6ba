//! Storage backends for [`WriteService`](super::WriteService).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::instrument;

use taskforge_core::Task;

use super::{WriteBatch, WriteError, WriteOp, WriteResult};
use crate::queue::store::in_memory::InMemoryQueueStore;
use crate::queue::store::postgres::{insert_task, map_sqlx_error};

/// Applies a whole batch or nothing.
#[async_trait]
pub trait WriteBackend: Send + Sync {
    async fn apply(&self, batch: &WriteBatch) -> Result<WriteResult, WriteError>;
}

fn result_for(batch: &WriteBatch) -> WriteResult {
    WriteResult {
        applied: batch.len(),
        enqueued: batch.tasks().map(|t| t.id).collect(),
        committed_at: Utc::now(),
    }
}

type RecordKey = (String, String);

/// Records map plus an in-memory queue.
///
/// Intended for tests/dev. The records lock is held while the tasks are
/// inserted, and records are only swapped in once the queue accepted every
/// task.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWriteBackend {
    records: Arc<Mutex<HashMap<RecordKey, Value>>>,
    queue: Arc<InMemoryQueueStore>,
}

impl InMemoryWriteBackend {
    /// Enqueue into `queue`, which a `QueueServer` may poll concurrently.
    pub fn new(queue: Arc<InMemoryQueueStore>) -> Self {
        Self {
            records: Arc::default(),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<InMemoryQueueStore> {
        &self.queue
    }

    pub async fn get_record(&self, collection: &str, key: &str) -> Option<Value> {
        self.records
            .lock()
            .await
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl WriteBackend for InMemoryWriteBackend {
    async fn apply(&self, batch: &WriteBatch) -> Result<WriteResult, WriteError> {
        let mut records = self.records.lock().await;

        let mut staged = records.clone();
        let mut tasks: Vec<Task> = Vec::new();
        for op in &batch.ops {
            match op {
                WriteOp::Enqueue(task) => tasks.push(task.clone()),
                WriteOp::Upsert {
                    collection,
                    key,
                    value,
                } => {
                    staged.insert((collection.clone(), key.clone()), value.clone());
                }
                WriteOp::Delete { collection, key } => {
                    staged.remove(&(collection.clone(), key.clone()));
                }
            }
        }

        self.queue.enqueue_all(tasks).await?;
        *records = staged;
        Ok(result_for(batch))
    }
}

const CREATE_WRITE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS write_records (
    collection  TEXT         NOT NULL,
    key         TEXT         NOT NULL,
    value       JSONB        NOT NULL,
    updated_at  TIMESTAMPTZ  NOT NULL,
    PRIMARY KEY (collection, key)
)
"#;

/// One Postgres transaction over `write_records` and `queue_tasks`.
///
/// Shares the `queue_tasks` table with
/// [`PostgresQueueStore`](crate::queue::PostgresQueueStore), so enqueued
/// tasks become visible to pollers exactly when the transaction commits.
#[derive(Debug, Clone)]
pub struct PostgresWriteBackend {
    pool: PgPool,
}

impl PostgresWriteBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create `write_records` if missing. `queue_tasks` is created by
    /// `PostgresQueueStore::ensure_schema`.
    pub async fn ensure_schema(&self) -> Result<(), WriteError> {
        sqlx::query(CREATE_WRITE_RECORDS)
            .execute(&self.pool)
            .await
            .map_err(|e| WriteError::from(map_sqlx_error("ensure_schema", e)))?;
        Ok(())
    }

    pub async fn get_record(&self, collection: &str, key: &str) -> Result<Option<Value>, WriteError> {
        sqlx::query_scalar::<_, Value>("SELECT value FROM write_records WHERE collection = $1 AND key = $2")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WriteError::from(map_sqlx_error("get_record", e)))
    }

    async fn apply_op(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        op: &WriteOp,
    ) -> Result<(), WriteError> {
        match op {
            WriteOp::Enqueue(task) => insert_task(&mut **tx, task).await?,
            WriteOp::Upsert {
                collection,
                key,
                value,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO write_records (collection, key, value, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (collection, key)
                    DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(collection)
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await
                .map_err(|e| WriteError::from(map_sqlx_error("upsert", e)))?;
            }
            WriteOp::Delete { collection, key } => {
                sqlx::query("DELETE FROM write_records WHERE collection = $1 AND key = $2")
                    .bind(collection)
                    .bind(key)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| WriteError::from(map_sqlx_error("delete", e)))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WriteBackend for PostgresWriteBackend {
    #[instrument(skip(self, batch), fields(ops = batch.len()), err)]
    async fn apply(&self, batch: &WriteBatch) -> Result<WriteResult, WriteError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| WriteError::from(map_sqlx_error("begin", e)))?;

        for op in &batch.ops {
            if let Err(e) = Self::apply_op(&mut tx, op).await {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed write did not complete");
                }
                return Err(e);
            }
        }

        tx.commit()
            .await
            .map_err(|e| WriteError::from(map_sqlx_error("commit", e)))?;
        Ok(result_for(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStore;
    use serde_json::json;
    use taskforge_core::EnqueueOptions;

    #[tokio::test]
    async fn records_and_tasks_land_together() {
        let backend = InMemoryWriteBackend::default();
        let batch = WriteBatch::new()
            .upsert("orders", "o-1", json!({"status": "placed"}))
            .enqueue(
                "email.send",
                json!({"order": "o-1"}),
                EnqueueOptions::new(),
                &crate::config::QueueConfig::default(),
            )
            .unwrap();

        let result = backend.apply(&batch).await.unwrap();

        assert_eq!(result.applied, 2);
        assert_eq!(result.enqueued.len(), 1);
        assert_eq!(
            backend.get_record("orders", "o-1").await,
            Some(json!({"status": "placed"}))
        );
        assert!(backend.queue().get(result.enqueued[0]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conflicting_task_leaves_records_untouched() {
        let backend = InMemoryWriteBackend::default();
        let existing = Task::new("x", json!({}), 3);
        backend.queue().enqueue(existing.clone()).await.unwrap();

        let batch = WriteBatch::new()
            .upsert("orders", "o-1", json!({"status": "placed"}))
            .push_task(existing);

        let err = backend.apply(&batch).await.unwrap_err();
        assert!(matches!(err, WriteError::Conflict(_)));
        assert_eq!(backend.record_count().await, 0);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let backend = InMemoryWriteBackend::default();
        backend
            .apply(&WriteBatch::new().upsert("carts", "c-1", json!([1, 2])))
            .await
            .unwrap();
        backend
            .apply(&WriteBatch::new().delete("carts", "c-1"))
            .await
            .unwrap();

        assert!(backend.get_record("carts", "c-1").await.is_none());
    }
}
