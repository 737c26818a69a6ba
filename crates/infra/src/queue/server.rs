//! Queue server: producer API, poll loop, retry and dead-letter policy.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use taskforge_core::{offset_by, DomainError, EnqueueOptions, Task, TaskError, TaskId, TaskRecord, TaskResult};
use taskforge_observability::{NoopMetrics, QueueMetrics};

use super::backoff::Backoff;
use super::error::QueueError;
use super::handler::{invoke, HandlerRegistry};
use super::store::QueueStore;
use crate::config::QueueConfig;

/// Counts reported by [`QueueServer::get_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub failed: u64,
}

struct Inner<S> {
    store: S,
    handlers: HandlerRegistry,
    config: QueueConfig,
    metrics: Arc<dyn QueueMetrics>,
    backoff: Backoff,
}

struct PollLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls a [`QueueStore`] and runs registered handlers.
///
/// Several servers may share one durable store; the store's atomic claim is
/// what keeps them from running the same task twice.
pub struct QueueServer<S> {
    inner: Arc<Inner<S>>,
    /// `Some` exactly while a poll loop is running.
    poll: Mutex<Option<PollLoop>>,
}

impl<S: QueueStore + 'static> std::fmt::Debug for QueueServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueServer")
            .field("name", &self.inner.config.name)
            .field("handlers", &self.inner.handlers)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<S> QueueServer<S>
where
    S: QueueStore + 'static,
{
    pub fn new(store: S, handlers: HandlerRegistry, config: QueueConfig) -> Self {
        Self::with_metrics(store, handlers, config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        store: S,
        handlers: HandlerRegistry,
        config: QueueConfig,
        metrics: Arc<dyn QueueMetrics>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base_ms, config.max_backoff_ms, config.backoff_jitter);
        Self::from_parts(store, handlers, config, metrics, backoff)
    }

    /// Use a caller-provided backoff (e.g. [`Backoff::seeded`] in tests).
    pub fn with_backoff(
        store: S,
        handlers: HandlerRegistry,
        config: QueueConfig,
        metrics: Arc<dyn QueueMetrics>,
        backoff: Backoff,
    ) -> Self {
        Self::from_parts(store, handlers, config, metrics, backoff)
    }

    fn from_parts(
        store: S,
        handlers: HandlerRegistry,
        config: QueueConfig,
        metrics: Arc<dyn QueueMetrics>,
        backoff: Backoff,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                handlers,
                config,
                metrics,
                backoff,
            }),
            poll: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn is_running(&self) -> bool {
        self.poll_slot().is_some()
    }

    fn poll_slot(&self) -> std::sync::MutexGuard<'_, Option<PollLoop>> {
        self.poll.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and persist a new task. Does not wait for processing.
    #[instrument(skip(self, args, options), fields(server = %self.inner.config.name), err)]
    pub async fn enqueue(
        &self,
        name: &str,
        args: Value,
        options: EnqueueOptions,
    ) -> Result<TaskId, QueueError> {
        let task = options
            .build(name, args, self.inner.config.default_max_attempts)
            .map_err(|e| match e {
                DomainError::Validation(msg) => QueueError::Validation(msg),
                other => QueueError::Domain(other),
            })?;
        let id = task.id;

        self.inner.store.enqueue(task).await?;
        self.inner.metrics.task_enqueued(name);
        debug!(task_id = %id, task = name, "task enqueued");
        Ok(id)
    }

    /// Spawn the poll loop on the current tokio runtime.
    ///
    /// Calling `start` on a running server does nothing.
    pub fn start(&self) -> Result<(), QueueError> {
        self.inner.config.validate()?;

        let mut poll = self.poll_slot();
        if poll.is_some() {
            debug!(server = %self.inner.config.name, "start ignored: already running");
            return Ok(());
        }

        let (shutdown, receiver) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(receiver).await });

        *poll = Some(PollLoop { shutdown, handle });
        drop(poll);

        info!(
            server = %self.inner.config.name,
            poll_interval_ms = self.inner.config.poll_interval_ms,
            handlers = ?self.inner.handlers.names(),
            "queue server started"
        );
        Ok(())
    }

    /// Stop polling and wait for in-flight handlers to finish.
    ///
    /// `is_running` turns false immediately. Stopping a server that is not
    /// running does nothing.
    pub async fn stop(&self) {
        let poll = self.poll_slot().take();
        let Some(poll) = poll else {
            return;
        };

        let _ = poll.shutdown.send(true);
        if let Err(e) = poll.handle.await {
            error!(server = %self.inner.config.name, error = %e, "poll loop ended abnormally");
        }
        info!(server = %self.inner.config.name, "queue server stopped");
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            pending: self.inner.store.pending_count().await?,
            failed: self.inner.store.failed_count().await?,
        })
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn clear_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        Ok(self.inner.store.clear_completed(before).await?)
    }

    /// Run a single poll tick and return how many tasks were processed.
    ///
    /// Works whether or not the loop is started.
    pub async fn run_once(&self) -> usize {
        self.inner.tick().await
    }
}

impl<S> Drop for QueueServer<S> {
    fn drop(&mut self) {
        if let Ok(mut poll) = self.poll.lock() {
            if let Some(poll) = poll.take() {
                let _ = poll.shutdown.send(true);
            }
        }
    }
}

impl<S> Inner<S>
where
    S: QueueStore + 'static,
{
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(server = %self.config.name, "poll loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>) -> usize {
        let mut in_flight = JoinSet::new();

        for _ in 0..self.config.max_concurrent.max(1) {
            match self.store.dequeue(Utc::now()).await {
                Ok(Some(task)) => {
                    let inner = self.clone();
                    in_flight.spawn(async move { inner.process(task).await });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(server = %self.config.name, error = %e, "dequeue failed");
                    break;
                }
            }
        }

        let processed = in_flight.len();
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(server = %self.config.name, error = %e, "task processing aborted");
            }
        }
        processed
    }

    #[instrument(
        skip_all,
        fields(
            server = %self.config.name,
            task_id = %task.id,
            task = %task.name,
            attempt = task.attempts
        )
    )]
    async fn process(&self, task: Task) {
        let Some(handler) = self.handlers.get(&task.name) else {
            warn!("no handler registered; dead-lettering task");
            self.dead_letter(&task, TaskError::no_handler(&task.name)).await;
            return;
        };

        let started = Instant::now();
        match invoke(handler, task.args.clone(), self.config.handler_timeout()).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let result = TaskResult::new(Utc::now(), duration_ms);
                match self.store.complete(task.id, result).await {
                    Ok(()) => {
                        self.metrics.task_completed(&task.name, duration_ms);
                        debug!(duration_ms, "task completed");
                    }
                    Err(e) => error!(error = %e, "failed to record completion"),
                }
            }
            Err(failure) if task.attempts_exhausted() => {
                warn!(
                    max_attempts = task.max_attempts,
                    error = %failure.message,
                    "task failed on final attempt"
                );
                self.dead_letter(&task, failure).await;
            }
            Err(failure) => {
                let delay = self.backoff.delay_for_attempt(task.attempts);
                let next_attempt_at = retry_at(Utc::now(), delay);
                warn!(
                    error = %failure.message,
                    retry_in_ms = delay.as_millis() as u64,
                    "task failed; scheduling retry"
                );
                match self.store.fail(task.id, failure, Some(next_attempt_at)).await {
                    Ok(()) => self.metrics.task_retried(&task.name, task.attempts),
                    Err(e) => error!(error = %e, "failed to reschedule task"),
                }
            }
        }
    }

    async fn dead_letter(&self, task: &Task, failure: TaskError) {
        match self.store.fail(task.id, failure, None).await {
            Ok(()) => self.metrics.task_dead_lettered(&task.name),
            Err(e) => error!(error = %e, "failed to dead-letter task"),
        }
    }
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    offset_by(now, delay)
}
