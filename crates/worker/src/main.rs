//! Standalone queue worker.
//!
//! Reads `QueueConfig` and the store backend from the environment, registers
//! the built-in handlers and polls until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use taskforge_infra::config::{QueueConfig, StoreBackend};
use taskforge_infra::queue::{HandlerRegistry, InMemoryQueueStore, PostgresQueueStore, QueueServer, QueueStore};

const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;
    let backend = StoreBackend::from_env().context("invalid store backend")?;
    let retention = retention_from_env()?;

    let store = build_store(&backend).await?;
    let server = QueueServer::new(store, handlers()?, config);

    server.start()?;
    tracing::info!(queue = %server.config().name, "worker started");

    let mut sweep = tokio::time::interval(RETENTION_SWEEP);
    sweep.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            _ = sweep.tick() => {
                let Some(before) = chrono::Utc::now().checked_sub_signed(retention) else {
                    tracing::debug!("retention reaches past the earliest timestamp; nothing to clear");
                    continue;
                };
                match server.clear_completed(before).await {
                    Ok(removed) => tracing::info!(removed, "cleared completed tasks"),
                    Err(e) => tracing::warn!(error = %e, "clear_completed failed"),
                }
            }
        }
    }

    tracing::info!("shutdown requested; waiting for in-flight tasks");
    server.stop().await;
    let stats = server.get_stats().await?;
    tracing::info!(pending = stats.pending, failed = stats.failed, "worker stopped");
    Ok(())
}

async fn build_store(backend: &StoreBackend) -> anyhow::Result<Arc<dyn QueueStore>> {
    match backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory queue store; tasks are lost on exit");
            Ok(Arc::new(InMemoryQueueStore::new()))
        }
        StoreBackend::Postgres { database_url } => {
            let store = PostgresQueueStore::connect(database_url)
                .await
                .context("failed to connect to postgres")?;
            store.ensure_schema().await.context("failed to create queue schema")?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis {
            redis_url,
            key_prefix,
        } => {
            let store = taskforge_infra::queue::RedisQueueStore::connect(redis_url, key_prefix.clone())
                .await
                .context("failed to connect to redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis { .. } => {
            anyhow::bail!("QUEUE_BACKEND=redis requires building with `--features redis`")
        }
    }
}

fn handlers() -> anyhow::Result<HandlerRegistry> {
    let registry = HandlerRegistry::new()
        .with("echo", |args: Value| async move {
            tracing::info!(%args, "echo");
            Ok::<(), anyhow::Error>(())
        })?
        .with("sleep", |args: Value| async move {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<(), anyhow::Error>(())
        })?;
    Ok(registry)
}

fn retention_from_env() -> anyhow::Result<chrono::Duration> {
    parse_retention(std::env::var("WORKER_RETENTION_HOURS").ok().as_deref())
}

fn parse_retention(raw: Option<&str>) -> anyhow::Result<chrono::Duration> {
    let hours = match raw {
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("WORKER_RETENTION_HOURS is not an integer: {raw}"))?,
        None => 24,
    };
    anyhow::ensure!(hours > 0, "WORKER_RETENTION_HOURS must be positive");
    chrono::Duration::try_hours(hours)
        .with_context(|| format!("WORKER_RETENTION_HOURS is out of range: {hours}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_defaults_to_a_day() {
        assert_eq!(parse_retention(None).unwrap(), chrono::Duration::hours(24));
        assert_eq!(parse_retention(Some("6")).unwrap(), chrono::Duration::hours(6));
    }

    #[test]
    fn bad_retention_is_an_error_not_a_panic() {
        assert!(parse_retention(Some("0")).is_err());
        assert!(parse_retention(Some("soon")).is_err());
        assert!(parse_retention(Some(&i64::MAX.to_string())).is_err());
    }
}
