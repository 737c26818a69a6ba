//! Atomic multi-step writes.
//!
//! A [`WriteBatch`] mixes record mutations with task enqueues. The batch is
//! applied all-or-nothing by a [`WriteBackend`], so a producer can update a
//! record *and* enqueue the follow-up task without ever observing one
//! without the other.
//!
//! Pipeline for [`WriteService::execute`]:
//!
//! 1. every hook's `before_validate` (any error rejects the batch)
//! 2. structural validation
//! 3. backend applies the batch in one transaction
//! 4. every hook's `after_write` (errors are logged, the write stands)

pub mod backend;
pub mod hooks;

pub use backend::{InMemoryWriteBackend, PostgresWriteBackend, WriteBackend};
pub use hooks::{AuditLogHook, WriteHook};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use taskforge_core::{EnqueueOptions, Task, TaskId};
use taskforge_observability::{NoopMetrics, QueueMetrics};

use crate::config::QueueConfig;
use crate::queue::QueueStoreError;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid write batch: {0}")]
    Validation(String),

    #[error("write rejected by hook {hook}: {reason}")]
    Rejected { hook: String, reason: String },

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("write backend error: {0}")]
    Backend(String),
}

impl From<QueueStoreError> for WriteError {
    fn from(value: QueueStoreError) -> Self {
        match value {
            QueueStoreError::AlreadyExists(id) => {
                WriteError::Conflict(format!("task {id} already exists"))
            }
            other => WriteError::Backend(other.to_string()),
        }
    }
}

/// One mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Enqueue(Task),
    Upsert {
        collection: String,
        key: String,
        value: Value,
    },
    Delete {
        collection: String,
        key: String,
    },
}

/// Ordered list of mutations applied as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteBatch {
    pub label: Option<String>,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Add an already-built task.
    pub fn push_task(mut self, task: Task) -> Self {
        self.ops.push(WriteOp::Enqueue(task));
        self
    }

    /// Build and add a task; unset options fall back to `config`, as
    /// [`QueueServer::enqueue`](crate::queue::QueueServer::enqueue) does.
    pub fn enqueue(
        self,
        name: impl Into<String>,
        args: Value,
        options: EnqueueOptions,
        config: &QueueConfig,
    ) -> Result<Self, WriteError> {
        let task = options
            .build(name, args, config.default_max_attempts)
            .map_err(|e| WriteError::Validation(e.to_string()))?;
        Ok(self.push_task(task))
    }

    pub fn upsert(mut self, collection: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        self.ops.push(WriteOp::Upsert {
            collection: collection.into(),
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, collection: impl Into<String>, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            key: key.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Tasks in batch order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.ops.iter().filter_map(|op| match op {
            WriteOp::Enqueue(task) => Some(task),
            _ => None,
        })
    }

    /// Structural checks that need no storage access.
    pub fn validate(&self) -> Result<(), WriteError> {
        if self.ops.is_empty() {
            return Err(WriteError::Validation("batch is empty".to_string()));
        }

        let mut task_ids = HashSet::new();
        for (idx, op) in self.ops.iter().enumerate() {
            match op {
                WriteOp::Enqueue(task) => {
                    task.validate()
                        .map_err(|e| WriteError::Validation(format!("op {idx}: {e}")))?;
                    if !task_ids.insert(task.id) {
                        return Err(WriteError::Validation(format!(
                            "op {idx}: task {} appears twice in the batch",
                            task.id
                        )));
                    }
                }
                WriteOp::Upsert { collection, key, .. } | WriteOp::Delete { collection, key } => {
                    if collection.trim().is_empty() || key.trim().is_empty() {
                        return Err(WriteError::Validation(format!(
                            "op {idx}: collection and key must not be blank"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    /// Number of operations applied
    pub applied: usize,
    /// Ids of the tasks enqueued, in batch order
    pub enqueued: Vec<TaskId>,
    pub committed_at: DateTime<Utc>,
}

/// Runs batches through hooks and a backend.
pub struct WriteService<B> {
    backend: B,
    hooks: Vec<Arc<dyn WriteHook>>,
    metrics: Arc<dyn QueueMetrics>,
}

impl<B> std::fmt::Debug for WriteService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks: Vec<&str> = self.hooks.iter().map(|h| h.name()).collect();
        f.debug_struct("WriteService").field("hooks", &hooks).finish_non_exhaustive()
    }
}

impl<B> WriteService<B>
where
    B: WriteBackend,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            hooks: Vec::new(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Report committed enqueues to `metrics` (usually the queue server's sink).
    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Append a hook; hooks run in registration order.
    pub fn with_hook(mut self, hook: impl WriteHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[instrument(
        skip(self, batch),
        fields(label = batch.label.as_deref().unwrap_or(""), ops = batch.len()),
        err
    )]
    pub async fn execute(&self, batch: WriteBatch) -> Result<WriteResult, WriteError> {
        for hook in &self.hooks {
            hook.before_validate(&batch)
                .await
                .map_err(|e| WriteError::Rejected {
                    hook: hook.name().to_string(),
                    reason: format!("{e:#}"),
                })?;
        }

        batch.validate()?;

        let result = self.backend.apply(&batch).await?;
        for task in batch.tasks() {
            self.metrics.task_enqueued(&task.name);
        }

        for hook in &self.hooks {
            if let Err(e) = hook.after_write(&batch, &result).await {
                warn!(hook = hook.name(), error = %format!("{e:#}"), "after_write hook failed");
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStore;
    use serde_json::json;

    #[test]
    fn empty_and_blank_batches_are_invalid() {
        assert!(matches!(WriteBatch::new().validate(), Err(WriteError::Validation(_))));

        let blank_key = WriteBatch::new().upsert("orders", " ", json!({}));
        assert!(matches!(blank_key.validate(), Err(WriteError::Validation(_))));
    }

    #[test]
    fn repeated_task_in_batch_is_invalid() {
        let task = Task::new("x", json!({}), 3);
        let batch = WriteBatch::new().push_task(task.clone()).push_task(task);
        assert!(matches!(batch.validate(), Err(WriteError::Validation(_))));
    }

    #[test]
    fn enqueue_builder_validates_options() {
        let err = WriteBatch::new()
            .enqueue("x", json!({}), EnqueueOptions::new().max_attempts(0), &QueueConfig::default())
            .unwrap_err();
        assert!(matches!(err, WriteError::Validation(_)));

        let batch = WriteBatch::new()
            .labeled("order.placed")
            .upsert("orders", "o-1", json!({"total": 10}))
            .enqueue("email.send", json!({"order": "o-1"}), EnqueueOptions::new(), &QueueConfig::default())
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.tasks().count(), 1);
        assert!(batch.validate().is_ok());
    }

    struct RejectDeletes;

    #[async_trait::async_trait]
    impl WriteHook for RejectDeletes {
        fn name(&self) -> &str {
            "reject_deletes"
        }

        async fn before_validate(&self, batch: &WriteBatch) -> anyhow::Result<()> {
            anyhow::ensure!(
                !batch.ops.iter().any(|op| matches!(op, WriteOp::Delete { .. })),
                "deletes are not allowed"
            );
            Ok(())
        }
    }

    struct BrokenAfterWrite;

    #[async_trait::async_trait]
    impl WriteHook for BrokenAfterWrite {
        fn name(&self) -> &str {
            "broken"
        }

        async fn after_write(&self, _batch: &WriteBatch, _result: &WriteResult) -> anyhow::Result<()> {
            anyhow::bail!("notification sink unavailable")
        }
    }

    #[tokio::test]
    async fn rejecting_hook_stops_the_batch() {
        let service = WriteService::new(InMemoryWriteBackend::default()).with_hook(RejectDeletes);

        let err = service
            .execute(WriteBatch::new().upsert("a", "1", json!(1)).delete("a", "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Rejected { ref hook, .. } if hook == "reject_deletes"));
        assert_eq!(service.backend().record_count().await, 0);
    }

    #[tokio::test]
    async fn after_write_failure_keeps_the_commit() {
        let service = WriteService::new(InMemoryWriteBackend::default())
            .with_hook(BrokenAfterWrite)
            .with_hook(AuditLogHook);

        let result = service
            .execute(
                WriteBatch::new()
                    .upsert("orders", "o-9", json!({"total": 3}))
                    .enqueue(
                        "invoice.render",
                        json!({"order": "o-9"}),
                        EnqueueOptions::new(),
                        &QueueConfig::default(),
                    )
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(result.applied, 2);
        assert_eq!(service.backend().record_count().await, 1);
        assert_eq!(service.backend().queue().pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_batch_never_reaches_the_backend() {
        let service = WriteService::new(InMemoryWriteBackend::default());
        let err = service.execute(WriteBatch::new()).await.unwrap_err();
        assert!(matches!(err, WriteError::Validation(_)));
    }

    #[test]
    fn enqueue_uses_the_configured_default_attempts() {
        let config = QueueConfig::default().with_default_max_attempts(7);
        let batch = WriteBatch::new()
            .enqueue("x", json!({}), EnqueueOptions::new(), &config)
            .unwrap()
            .enqueue("y", json!({}), EnqueueOptions::new().max_attempts(2), &config)
            .unwrap();

        let attempts: Vec<u32> = batch.tasks().map(|t| t.max_attempts).collect();
        assert_eq!(attempts, vec![7, 2]);
    }

    #[tokio::test]
    async fn committed_enqueues_reach_the_metrics_sink() {
        let metrics = Arc::new(taskforge_observability::CountingMetrics::new());
        let service = WriteService::new(InMemoryWriteBackend::default()).with_metrics(metrics.clone());
        let config = QueueConfig::default();

        service
            .execute(
                WriteBatch::new()
                    .upsert("orders", "o-1", json!({}))
                    .enqueue("a", json!({}), EnqueueOptions::new(), &config)
                    .unwrap()
                    .enqueue("b", json!({}), EnqueueOptions::new(), &config)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(metrics.snapshot().enqueued, 2);

        let err = service.execute(WriteBatch::new()).await.unwrap_err();
        assert!(matches!(err, WriteError::Validation(_)));
        assert_eq!(metrics.snapshot().enqueued, 2);
    }

    #[test]
    fn duplicate_task_maps_to_conflict() {
        let id = TaskId::new();
        assert!(matches!(
            WriteError::from(QueueStoreError::AlreadyExists(id)),
            WriteError::Conflict(_)
        ));
        assert!(matches!(
            WriteError::from(QueueStoreError::Query("x".into())),
            WriteError::Backend(_)
        ));
    }
}
