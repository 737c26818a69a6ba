//! `taskforge-core` — task model building blocks.
//!
//! This crate contains **pure domain** primitives for the task queue (no
//! infrastructure concerns). Stores, the queue server and the write service
//! live in `taskforge-infra`.

pub mod error;
pub mod id;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::TaskId;
pub use task::{offset_by, EnqueueOptions, Task, TaskError, TaskRecord, TaskResult, TaskStatus};
