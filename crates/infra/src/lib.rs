//! Infrastructure layer: queue stores, queue server, write service, config.

pub mod config;
pub mod queue;
pub mod write;

pub use config::{ConfigError, QueueConfig, StoreBackend};
