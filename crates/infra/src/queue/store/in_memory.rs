use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use taskforge_core::{Task, TaskError, TaskId, TaskRecord, TaskResult, TaskStatus};

use super::{QueueStore, QueueStoreError};

#[derive(Debug, Clone)]
struct Entry {
    record: TaskRecord,
    /// Insertion order, used to break `scheduled_at` ties.
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<TaskId, Entry>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            task.id,
            Entry {
                record: TaskRecord::pending(task),
                seq,
            },
        );
    }

    fn processing_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.record.status == TaskStatus::Processing => Some(&mut entry.record),
            Some(entry) => {
                tracing::debug!(task_id = %id, status = %entry.record.status, "ignoring transition on task that is not processing");
                None
            }
            None => {
                tracing::debug!(task_id = %id, "ignoring transition on unknown task");
                None
            }
        }
    }
}

/// In-memory queue store.
///
/// Intended for tests/dev. Single process only: one mutex around the whole
/// map is what makes `dequeue` atomic, and `dequeue` is a linear scan.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: Mutex<State>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert several tasks, all or none.
    ///
    /// Used by the in-memory write backend so a batch either lands whole or
    /// leaves the queue untouched.
    pub(crate) async fn enqueue_all(&self, tasks: Vec<Task>) -> Result<(), QueueStoreError> {
        let mut state = self.state.lock().await;
        let mut seen = std::collections::HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if state.entries.contains_key(&task.id) || !seen.insert(task.id) {
                return Err(QueueStoreError::AlreadyExists(task.id));
            }
        }
        for task in tasks {
            state.insert(task);
        }
        Ok(())
    }

    /// Number of tasks currently claimed by a poller.
    pub async fn processing_count(&self) -> u64 {
        self.count(TaskStatus::Processing).await
    }

    async fn count(&self, status: TaskStatus) -> u64 {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.record.status == status)
            .count() as u64
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, task: Task) -> Result<(), QueueStoreError> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&task.id) {
            return Err(QueueStoreError::AlreadyExists(task.id));
        }
        state.insert(task);
        Ok(())
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueStoreError> {
        let mut state = self.state.lock().await;

        let next = state
            .entries
            .values()
            .filter(|e| e.record.status == TaskStatus::Pending && e.record.task.is_eligible(now))
            .min_by_key(|e| (e.record.task.scheduled_at, e.seq))
            .map(|e| e.record.task.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };

        entry.record.status = TaskStatus::Processing;
        entry.record.task.attempts += 1;
        entry.record.updated_at = now;
        Ok(Some(entry.record.task.clone()))
    }

    async fn complete(&self, id: TaskId, result: TaskResult) -> Result<(), QueueStoreError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.processing_mut(id) {
            record.status = TaskStatus::Completed;
            record.updated_at = result.completed_at;
            record.result = Some(result);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueStoreError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.processing_mut(id) {
            record.updated_at = error.occurred_at;
            record.last_error = Some(error);
            match next_attempt_at {
                Some(at) => {
                    record.status = TaskStatus::Pending;
                    record.task.scheduled_at = at;
                }
                None => record.status = TaskStatus::Failed,
            }
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueStoreError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(&id).map(|e| e.record.clone()))
    }

    async fn pending_count(&self) -> Result<u64, QueueStoreError> {
        Ok(self.count(TaskStatus::Pending).await)
    }

    async fn failed_count(&self) -> Result<u64, QueueStoreError> {
        Ok(self.count(TaskStatus::Failed).await)
    }

    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        let mut state = self.state.lock().await;
        let before_len = state.entries.len();
        state.entries.retain(|_, e| {
            let expired = e.record.status == TaskStatus::Completed
                && e.record
                    .result
                    .as_ref()
                    .map(|r| r.completed_at < before)
                    .unwrap_or(false);
            !expired
        });
        Ok((before_len - state.entries.len()) as u64)
    }
}
