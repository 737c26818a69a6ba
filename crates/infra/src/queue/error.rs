use thiserror::Error;

use taskforge_core::DomainError;

use super::store::QueueStoreError;
use crate::config::ConfigError;

/// Errors surfaced to producers and to whoever drives the server lifecycle.
///
/// Handler failures never show up here: they are recorded on the task and
/// retried or dead-lettered by the poll loop.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("handler already registered for task: {0}")]
    DuplicateHandler(String),

    #[error(transparent)]
    Store(#[from] QueueStoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}
