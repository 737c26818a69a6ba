//! Core task types.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;

/// A unit of deferred, named work.
///
/// Store-side lifecycle state is deliberately not part of this struct: it is
/// what producers build and what `dequeue` hands to the server. The full
/// stored view is [`TaskRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID, assigned at enqueue time
    pub id: TaskId,
    /// Handler lookup key
    pub name: String,
    /// Opaque payload passed verbatim to the handler
    pub args: serde_json::Value,
    /// Not eligible for dequeue before this instant
    pub scheduled_at: DateTime<Utc>,
    /// Number of dequeues so far (starts at 0)
    pub attempts: u32,
    /// Failure with `attempts == max_attempts` is terminal
    pub max_attempts: u32,
    /// When the task was created
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task that is eligible immediately.
    pub fn new(name: impl Into<String>, args: serde_json::Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: name.into(),
            args,
            scheduled_at: now,
            attempts: 0,
            max_attempts,
            created_at: now,
        }
    }

    /// Use an explicit id (tests, idempotent producers).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Schedule the task for a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Schedule the task with a delay from its creation time.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = offset_by(self.created_at, delay);
        self
    }

    /// Check the invariants a producer-built task must satisfy.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("task name must not be blank"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation(format!(
                "max_attempts must be at least 1 (task {})",
                self.name
            )));
        }
        if self.attempts > self.max_attempts {
            return Err(DomainError::validation(format!(
                "attempts ({}) exceeds max_attempts ({})",
                self.attempts, self.max_attempts
            )));
        }
        Ok(())
    }

    /// Whether the task may be dequeued at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Whether a failure at the current attempt count is terminal.
    ///
    /// `attempts` is incremented at dequeue time, so this is evaluated on the
    /// post-increment value.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// `at + delay`, saturating at the latest representable instant.
pub fn offset_by(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-call overrides for [`Task`] construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(offset_by(Utc::now(), delay));
        self
    }

    /// Build a task, filling unset fields from the given defaults.
    pub fn build(
        &self,
        name: impl Into<String>,
        args: serde_json::Value,
        default_max_attempts: u32,
    ) -> DomainResult<Task> {
        let mut task = Task::new(name, args, self.max_attempts.unwrap_or(default_max_attempts));
        if let Some(at) = self.scheduled_at {
            task.scheduled_at = at;
        }
        task.validate()?;
        Ok(task)
    }
}

/// Conceptual lifecycle state of a stored task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `scheduled_at` / a poller
    Pending,
    /// Claimed by a dequeue, handler running
    Processing,
    /// Handler succeeded
    Completed,
    /// Dead-lettered (missing handler or retries exhausted)
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Completion metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn new(completed_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            completed_at,
            duration_ms,
        }
    }
}

/// Failure metadata captured when a task fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    /// Error chain, panic note or other diagnostic detail
    pub context: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Error for a task whose name has no registered handler.
    pub fn no_handler(name: &str) -> Self {
        Self::new(format!("No handler registered for task: {name}"))
    }
}

impl From<&anyhow::Error> for TaskError {
    fn from(err: &anyhow::Error) -> Self {
        let error = TaskError::new(err.to_string());
        if err.chain().count() > 1 {
            error.with_context(format!("{err:#}"))
        } else {
            error
        }
    }
}

/// Stored view of a task returned by point lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    /// Most recent failure, kept across retries
    pub last_error: Option<TaskError>,
    pub result: Option<TaskResult>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A freshly enqueued record.
    pub fn pending(task: Task) -> Self {
        Self {
            updated_at: task.created_at,
            task,
            status: TaskStatus::Pending,
            last_error: None,
            result: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn new_task_is_immediately_eligible() {
        let task = Task::new("email.send", serde_json::json!({"to": "a@b.c"}), 3);

        assert_eq!(task.attempts, 0);
        assert!(task.is_eligible(Utc::now()));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn delayed_task_is_not_eligible_before_its_time() {
        let task = Task::new("report", serde_json::json!({}), 3).delayed(Duration::from_secs(60));

        assert!(!task.is_eligible(task.created_at));
        assert!(task.is_eligible(task.created_at + chrono::Duration::seconds(60)));
    }

    #[test]
    fn oversized_delays_saturate_instead_of_becoming_due() {
        let task = Task::new("x", serde_json::json!({}), 3).delayed(Duration::MAX);
        assert_eq!(task.scheduled_at, DateTime::<Utc>::MAX_UTC);
        assert!(!task.is_eligible(Utc::now()));

        // Fits chrono::Duration but overflows the DateTime range.
        let options = EnqueueOptions::new().delayed(Duration::from_secs(10_000_000_000_000));
        assert_eq!(options.scheduled_at, Some(DateTime::<Utc>::MAX_UTC));
        let task = options.build("x", serde_json::json!({}), 3).unwrap();
        assert!(!task.is_eligible(Utc::now()));
    }

    #[test]
    fn blank_name_and_zero_attempts_are_rejected() {
        let blank = Task::new("  ", serde_json::json!({}), 3);
        assert!(matches!(blank.validate(), Err(DomainError::Validation(_))));

        let zero = Task::new("x", serde_json::json!({}), 0);
        assert!(matches!(zero.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn exhaustion_uses_post_increment_attempts() {
        let mut task = Task::new("x", serde_json::json!({}), 1);
        assert!(!task.attempts_exhausted());

        task.attempts = 1;
        assert!(task.attempts_exhausted());
    }

    #[test]
    fn options_override_defaults() {
        let at = Utc::now() + chrono::Duration::minutes(5);
        let task = EnqueueOptions::new()
            .max_attempts(7)
            .scheduled_at(at)
            .build("x", serde_json::json!({"k": 1}), 3)
            .unwrap();

        assert_eq!(task.max_attempts, 7);
        assert_eq!(task.scheduled_at, at);

        let defaulted = EnqueueOptions::new().build("x", serde_json::json!({}), 3).unwrap();
        assert_eq!(defaulted.max_attempts, 3);
    }

    #[test]
    fn options_reject_zero_max_attempts() {
        let err = EnqueueOptions::new()
            .max_attempts(0)
            .build("x", serde_json::json!({}), 3)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn task_error_keeps_anyhow_chain() {
        let err: anyhow::Error = Err::<(), _>(std::io::Error::other("disk full"))
            .context("writing thumbnail")
            .unwrap_err();

        let task_error = TaskError::from(&err);
        assert_eq!(task_error.message, "writing thumbnail");
        assert_eq!(
            task_error.context.as_deref(),
            Some("writing thumbnail: disk full")
        );

        let plain = TaskError::from(&anyhow::anyhow!("boom"));
        assert_eq!(plain.message, "boom");
        assert!(plain.context.is_none());
    }
}
