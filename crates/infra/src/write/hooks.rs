//! Cross-cutting hooks around [`WriteService::execute`](super::WriteService::execute).

use async_trait::async_trait;

use super::{WriteBatch, WriteOp, WriteResult};

/// Hook points around a write.
///
/// Both methods default to doing nothing, so a hook only overrides what it
/// cares about.
#[async_trait]
pub trait WriteHook: Send + Sync {
    /// Used in logs and in `WriteError::Rejected`.
    fn name(&self) -> &str;

    /// Runs before validation. Returning an error rejects the whole batch.
    async fn before_validate(&self, _batch: &WriteBatch) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after commit. Errors are logged; the write is not undone.
    async fn after_write(&self, _batch: &WriteBatch, _result: &WriteResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs every committed batch at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditLogHook;

#[async_trait]
impl WriteHook for AuditLogHook {
    fn name(&self) -> &str {
        "audit_log"
    }

    async fn after_write(&self, batch: &WriteBatch, result: &WriteResult) -> anyhow::Result<()> {
        let (upserts, deletes) = batch.ops.iter().fold((0usize, 0usize), |(u, d), op| match op {
            WriteOp::Upsert { .. } => (u + 1, d),
            WriteOp::Delete { .. } => (u, d + 1),
            WriteOp::Enqueue(_) => (u, d),
        });
        let enqueued: Vec<String> = result.enqueued.iter().map(|id| id.to_string()).collect();

        tracing::info!(
            label = batch.label.as_deref().unwrap_or("unlabeled"),
            applied = result.applied,
            upserts,
            deletes,
            enqueued = ?enqueued,
            committed_at = %result.committed_at,
            "write batch committed"
        );
        Ok(())
    }
}
