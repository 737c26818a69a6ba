//! Persistent task queue.
//!
//! Producers call [`QueueServer::enqueue`]; the server's poll loop claims
//! due tasks from a [`QueueStore`], runs the matching [`TaskHandler`], and
//! then either completes the task, reschedules it with exponential backoff,
//! or dead-letters it once `max_attempts` is reached.
//!
//! ```text
//! pending ──dequeue──▶ processing ──ok──▶ completed
//!    ▲                     │
//!    └──fail(retry_at)─────┤
//!                          └──fail(exhausted / no handler)──▶ failed
//! ```

pub mod backoff;
pub mod error;
pub mod handler;
pub mod server;
pub mod store;

pub use backoff::{compute_backoff, jittered_backoff, Backoff};
pub use error::QueueError;
pub use handler::{HandlerRegistry, TaskHandler};
pub use server::{QueueServer, QueueStats};
pub use store::{InMemoryQueueStore, PostgresQueueStore, QueueStore, QueueStoreError};
#[cfg(feature = "redis")]
pub use store::RedisQueueStore;
