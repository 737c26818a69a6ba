//! Task handlers and their registry.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use taskforge_core::TaskError;

use super::error::QueueError;

/// Executes one kind of task.
///
/// Returning `Err` (or panicking) counts as a failed attempt; the server
/// decides between retry and dead-letter.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, args: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, args: Value) -> anyhow::Result<()> {
        (self)(args).await
    }
}

/// Name → handler map, fixed before the server is constructed.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// A name can be registered once; a second registration is rejected
    /// rather than silently replacing the first.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> Result<(), QueueError>
    where
        H: TaskHandler,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::Validation("handler name must not be blank".to_string()));
        }
        if self.handlers.contains_key(&name) {
            return Err(QueueError::DuplicateHandler(name));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with<H>(mut self, name: impl Into<String>, handler: H) -> Result<Self, QueueError>
    where
        H: TaskHandler,
    {
        self.register(name, handler)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run a handler on its own tokio task.
///
/// Panics and timeouts come back as a [`TaskError`] like any other failure.
pub(crate) async fn invoke(
    handler: Arc<dyn TaskHandler>,
    args: Value,
    timeout: Option<Duration>,
) -> Result<(), TaskError> {
    let mut join = tokio::spawn(async move { handler.handle(args).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut join).await {
            Ok(joined) => joined,
            Err(_) => {
                join.abort();
                return Err(TaskError::new(format!(
                    "handler timed out after {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => join.await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TaskError::from(&err)),
        Err(join_err) if join_err.is_panic() => {
            let note = panic_message(join_err.into_panic());
            Err(TaskError::new(format!("handler panicked: {note}")).with_context("panic"))
        }
        Err(join_err) => Err(TaskError::new(format!("handler task aborted: {join_err}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, args: Value) -> anyhow::Result<()> {
            if args.get("fail").is_some() {
                bail!("asked to fail");
            }
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Echo).unwrap();

        let err = registry.register("echo", Echo).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateHandler(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn blank_names_are_rejected() {
        let err = HandlerRegistry::new().with(" ", Echo).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn closures_register_as_handlers() {
        let registry = HandlerRegistry::new()
            .with("noop", |_args: Value| async { Ok::<(), anyhow::Error>(()) })
            .unwrap()
            .with("echo", Echo)
            .unwrap();

        assert_eq!(registry.names(), vec!["echo", "noop"]);
        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn handler_errors_become_task_errors() {
        let result = invoke(Arc::new(Echo), json!({"fail": true}), None).await;
        assert_eq!(result.unwrap_err().message, "asked to fail");

        assert!(invoke(Arc::new(Echo), json!({}), None).await.is_ok());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let handler = |_args: Value| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<(), anyhow::Error>(())
        };

        let err = invoke(Arc::new(handler), json!({}), None).await.unwrap_err();
        assert!(err.message.contains("kaboom"), "{}", err.message);
        assert_eq!(err.context.as_deref(), Some("panic"));
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let handler = |_args: Value| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), anyhow::Error>(())
        };

        let err = invoke(Arc::new(handler), json!({}), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.message.contains("timed out"));
    }
}
