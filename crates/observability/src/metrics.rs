//! Metrics sink for queue outcomes.
//!
//! The queue only *reports* outcomes through [`QueueMetrics`]; exporting them
//! (Prometheus, OTLP, logs) is the embedding application's business.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receiver for queue outcome counters.
pub trait QueueMetrics: Send + Sync {
    /// A task was accepted by the store.
    fn task_enqueued(&self, name: &str);

    /// A handler finished successfully.
    fn task_completed(&self, name: &str, duration_ms: u64);

    /// A handler failed and the task was rescheduled.
    fn task_retried(&self, name: &str, attempt: u32);

    /// The task reached the terminal `failed` state.
    fn task_dead_lettered(&self, name: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl QueueMetrics for NoopMetrics {
    fn task_enqueued(&self, _name: &str) {}
    fn task_completed(&self, _name: &str, _duration_ms: u64) {}
    fn task_retried(&self, _name: &str, _attempt: u32) {}
    fn task_dead_lettered(&self, _name: &str) {}
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`CountingMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

impl QueueMetrics for CountingMetrics {
    fn task_enqueued(&self, _name: &str) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn task_completed(&self, _name: &str, _duration_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn task_retried(&self, _name: &str, _attempt: u32) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn task_dead_lettered(&self, _name: &str) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_metrics_tracks_each_outcome() {
        let metrics = CountingMetrics::new();
        metrics.task_enqueued("a");
        metrics.task_enqueued("b");
        metrics.task_retried("a", 1);
        metrics.task_completed("a", 12);
        metrics.task_dead_lettered("b");

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                enqueued: 2,
                completed: 1,
                retried: 1,
                dead_lettered: 1,
            }
        );
    }
}
