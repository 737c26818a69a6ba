//! Configuration loading and representation.
//!
//! Everything is read from the process environment with defaults suited to a
//! local run. Values that are present but malformed are an error rather than
//! silently replaced by the default.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 300_000;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.5;
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_REDIS_PREFIX: &str = "taskforge:queue";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Queue server tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Label used in logs
    pub name: String,
    /// Poll loop cadence
    pub poll_interval_ms: u64,
    /// Fallback when a task doesn't specify `max_attempts`
    pub default_max_attempts: u32,
    /// First retry delay
    pub backoff_base_ms: u64,
    /// Retry delay ceiling
    pub max_backoff_ms: u64,
    /// Fraction of the computed delay that may be shaved off at random (0.0-1.0)
    pub backoff_jitter: f64,
    /// Tasks claimed per poll tick
    pub max_concurrent: usize,
    /// Per-handler timeout; a timeout counts as a handler failure
    pub handler_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "task-queue".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            max_concurrent: 1,
            handler_timeout_ms: None,
        }
    }
}

impl QueueConfig {
    /// Read `QUEUE_*` variables from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an injectable source (tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            name: lookup("QUEUE_NAME").unwrap_or(defaults.name),
            poll_interval_ms: parse_or(&lookup, "QUEUE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            default_max_attempts: parse_or(
                &lookup,
                "QUEUE_DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            backoff_base_ms: parse_or(&lookup, "QUEUE_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            max_backoff_ms: parse_or(&lookup, "QUEUE_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            backoff_jitter: parse_or(&lookup, "QUEUE_BACKOFF_JITTER", defaults.backoff_jitter)?,
            max_concurrent: parse_or(&lookup, "QUEUE_MAX_CONCURRENT", defaults.max_concurrent)?,
            handler_timeout_ms: parse_opt(&lookup, "QUEUE_HANDLER_TIMEOUT_MS")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("QUEUE_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        if self.default_max_attempts == 0 {
            return Err(invalid("QUEUE_DEFAULT_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("QUEUE_MAX_CONCURRENT", "0", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(invalid(
                "QUEUE_BACKOFF_JITTER",
                &self.backoff_jitter.to_string(),
                "must be within 0.0..=1.0",
            ));
        }
        if self.handler_timeout_ms == Some(0) {
            return Err(invalid("QUEUE_HANDLER_TIMEOUT_MS", "0", "must be positive"));
        }
        Ok(())
    }
}

/// Which queue store backend to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { database_url: String },
    Redis { redis_url: String, key_prefix: String },
}

impl StoreBackend {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = lookup("QUEUE_BACKEND").unwrap_or_else(|| "memory".to_string());
        match backend.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => {
                let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
                Ok(StoreBackend::Postgres { database_url })
            }
            "redis" => Ok(StoreBackend::Redis {
                redis_url: lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
                key_prefix: lookup("QUEUE_REDIS_PREFIX")
                    .unwrap_or_else(|| DEFAULT_REDIS_PREFIX.to_string()),
            }),
            _ => Err(invalid(
                "QUEUE_BACKEND",
                &backend,
                "expected one of memory, postgres, redis",
            )),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres { .. } => "postgres",
            StoreBackend::Redis { .. } => "redis",
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &e.to_string())),
    }
}
