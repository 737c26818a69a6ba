//! Postgres-backed queue store.
//!
//! All task state lives in one `queue_tasks` table. The claim performed by
//! `dequeue` is a single statement:
//!
//! ```sql
//! UPDATE queue_tasks SET status = 'processing', attempts = attempts + 1
//! WHERE id = (SELECT id FROM queue_tasks WHERE status = 'pending' AND scheduled_at <= $1
//!             ORDER BY scheduled_at, seq LIMIT 1 FOR UPDATE SKIP LOCKED)
//! RETURNING ...
//! ```
//!
//! so any number of servers can poll the same table and each pending row is
//! handed to exactly one of them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (enqueue) / `Query` |
//! | Database (other) | Any other | `Query` |
//! | PoolClosed / Io / Tls / PoolTimedOut | N/A | `Connection` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Query` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;

use taskforge_core::{Task, TaskError, TaskId, TaskRecord, TaskResult, TaskStatus};

use super::{QueueStore, QueueStoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_tasks (
    seq           BIGSERIAL    NOT NULL,
    id            UUID         PRIMARY KEY,
    name          TEXT         NOT NULL,
    args          JSONB        NOT NULL,
    status        TEXT         NOT NULL,
    scheduled_at  TIMESTAMPTZ  NOT NULL,
    attempts      INTEGER      NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts  INTEGER      NOT NULL CHECK (max_attempts >= 1),
    last_error    JSONB        NULL,
    result        JSONB        NULL,
    completed_at  TIMESTAMPTZ  NULL,
    created_at    TIMESTAMPTZ  NOT NULL,
    updated_at    TIMESTAMPTZ  NOT NULL
)
"#;

const CREATE_PENDING_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS queue_tasks_pending_idx
    ON queue_tasks (scheduled_at, seq)
    WHERE status = 'pending'
"#;

const CREATE_COMPLETED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS queue_tasks_completed_idx
    ON queue_tasks (completed_at)
    WHERE status = 'completed'
"#;

const TASK_COLUMNS: &str =
    "id, name, args, status, scheduled_at, attempts, max_attempts, last_error, result, created_at, updated_at";

/// Postgres-backed queue store.
///
/// `complete` and `fail` are conditional updates guarded by
/// `status = 'processing'`; rows in any other state are left untouched.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self, QueueStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `queue_tasks` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), QueueStoreError> {
        for statement in [CREATE_TABLE, CREATE_PENDING_INDEX, CREATE_COMPLETED_INDEX] {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn count_status(&self, status: TaskStatus) -> Result<u64, QueueStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_tasks WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(count.max(0) as u64)
    }
}

/// Insert a pending task through any executor (pool or open transaction).
pub(crate) async fn insert_task<'e, E>(executor: E, task: &Task) -> Result<(), QueueStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO queue_tasks
            (id, name, args, status, scheduled_at, attempts, max_attempts, created_at, updated_at)
        VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $7)
        "#,
    )
    .bind(task.id.as_uuid())
    .bind(&task.name)
    .bind(&task.args)
    .bind(task.scheduled_at)
    .bind(to_db_count(task.attempts, "attempts")?)
    .bind(to_db_count(task.max_attempts, "max_attempts")?)
    .bind(task.created_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            QueueStoreError::AlreadyExists(task.id)
        } else {
            map_sqlx_error("enqueue", e)
        }
    })?;
    Ok(())
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, task = %task.name), err)]
    async fn enqueue(&self, task: Task) -> Result<(), QueueStoreError> {
        insert_task(&*self.pool, &task).await
    }

    #[instrument(skip(self), err)]
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueStoreError> {
        let sql = format!(
            r#"
            UPDATE queue_tasks
            SET status = 'processing',
                attempts = attempts + 1,
                updated_at = $1
            WHERE id = (
                SELECT id FROM queue_tasks
                WHERE status = 'pending' AND scheduled_at <= $1
                ORDER BY scheduled_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dequeue", e))?;

        match row {
            Some(row) => {
                let row = TaskRow::from_pg_row(&row)?;
                Ok(Some(row.into_record()?.task))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, result), fields(task_id = %id), err)]
    async fn complete(&self, id: TaskId, result: TaskResult) -> Result<(), QueueStoreError> {
        let payload = serde_json::to_value(&result)?;
        let updated = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'completed',
                result = $2,
                completed_at = $3,
                updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(payload)
        .bind(result.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?
        .rows_affected();

        if updated == 0 {
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
        let payload = serde_json::to_value(&error)?;
        let query = match next_attempt_at {
            Some(at) => sqlx::query(
                r#"
                UPDATE queue_tasks
                SET status = 'pending',
                    scheduled_at = $3,
                    last_error = $2,
                    updated_at = $4
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(id.as_uuid())
            .bind(payload)
            .bind(at)
            .bind(error.occurred_at),
            None => sqlx::query(
                r#"
                UPDATE queue_tasks
                SET status = 'failed',
                    last_error = $2,
                    updated_at = $3
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(id.as_uuid())
            .bind(payload)
            .bind(error.occurred_at),
        };

        let updated = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?
            .rows_affected();

        if updated == 0 {
            tracing::debug!(task_id = %id, "fail ignored: task unknown or not processing");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueStoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| TaskRow::from_pg_row(&r)?.into_record()).transpose()
    }

    async fn pending_count(&self) -> Result<u64, QueueStoreError> {
        self.count_status(TaskStatus::Pending).await
    }

    async fn failed_count(&self) -> Result<u64, QueueStoreError> {
        self.count_status(TaskStatus::Failed).await
    }

    #[instrument(skip(self), err)]
    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        let removed = sqlx::query(
            "DELETE FROM queue_tasks WHERE status = 'completed' AND completed_at < $1",
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("clear_completed", e))?
        .rows_affected();
        Ok(removed)
    }
}

/// Map SQLx errors to queue store errors.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueStoreError::Query(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            QueueStoreError::Connection(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => QueueStoreError::Connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => QueueStoreError::Connection(format!("tls error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            QueueStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => QueueStoreError::Query(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn to_db_count(value: u32, field: &str) -> Result<i32, QueueStoreError> {
    i32::try_from(value)
        .map_err(|_| QueueStoreError::Serialization(format!("{field} {value} does not fit INTEGER")))
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    name: String,
    args: serde_json::Value,
    status: String,
    scheduled_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> Result<Self, QueueStoreError> {
        let decode = |e: sqlx::Error| QueueStoreError::Serialization(format!("failed to decode task row: {e}"));
        Ok(TaskRow {
            id: row.try_get("id").map_err(decode)?,
            name: row.try_get("name").map_err(decode)?,
            args: row.try_get("args").map_err(decode)?,
            status: row.try_get("status").map_err(decode)?,
            scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
            attempts: row.try_get("attempts").map_err(decode)?,
            max_attempts: row.try_get("max_attempts").map_err(decode)?,
            last_error: row.try_get("last_error").map_err(decode)?,
            result: row.try_get("result").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, QueueStoreError> {
        let corrupt = |reason: String| QueueStoreError::Corrupt {
            id: self.id.to_string(),
            reason,
        };

        let status: TaskStatus = self.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| corrupt(format!("negative attempts {}", self.attempts)))?;
        let max_attempts = u32::try_from(self.max_attempts)
            .map_err(|_| corrupt(format!("negative max_attempts {}", self.max_attempts)))?;
        let last_error = self
            .last_error
            .map(serde_json::from_value::<TaskError>)
            .transpose()
            .map_err(|e| corrupt(format!("last_error: {e}")))?;
        let result = self
            .result
            .map(serde_json::from_value::<TaskResult>)
            .transpose()
            .map_err(|e| corrupt(format!("result: {e}")))?;

        Ok(TaskRecord {
            task: Task {
                id: TaskId::from_uuid(self.id),
                name: self.name,
                args: self.args,
                scheduled_at: self.scheduled_at,
                attempts,
                max_attempts,
                created_at: self.created_at,
            },
            status,
            last_error,
            result,
            updated_at: self.updated_at,
        })
    }
}
