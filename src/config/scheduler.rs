//! Scheduler configuration structures.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable prefix read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "DEFERRED_SCHEDULER_";

/// What to do when a repository write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistencePolicy {
    /// Retry with backoff; hold back reporting and buffer release until persisted.
    #[default]
    Durable,
    /// Log the failure and carry on as if the write succeeded.
    BestEffort,
}

/// How the hard timeout interacts with transient-failure retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// One hard timeout covers every attempt of a job.
    #[default]
    SpanRetries,
    /// The hard timeout is re-armed whenever a retry attempt starts.
    PerAttempt,
}

/// Repository backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryBackendConfig {
    /// In-memory repository for development/testing.
    #[default]
    InMemory,
    /// JSON-lines log in `path`.
    File {
        /// Directory holding the log.
        path: PathBuf,
    },
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_ms: u64,
}

impl BackoffConfig {
    /// Create a backoff policy.
    #[must_use]
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_ms))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(100, 5_000)
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs executing at once; also the worker thread count.
    pub concurrency_budget: usize,
    /// Maximum queued jobs before rejection.
    pub max_queue_depth: usize,
    /// Default hard timeout for a running job, in milliseconds.
    pub hard_timeout_ms: u64,
    /// How long a canceled running job may take to stop, in milliseconds.
    pub cancel_grace_ms: u64,
    /// Retries after a transient feature failure.
    pub max_transient_retries: u32,
    /// Backoff between transient-failure retries.
    pub retry_backoff: BackoffConfig,
    /// Backoff between repository write retries.
    pub repository_backoff: BackoffConfig,
    /// Repository write failure handling.
    pub persistence: PersistencePolicy,
    /// Hard timeout vs. retry interaction.
    pub timeout_policy: TimeoutPolicy,
    /// Repository backend selection.
    pub repository: RepositoryBackendConfig,
    /// Stack size of worker threads, in bytes.
    pub thread_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_budget: (num_cpus::get() / 2).clamp(1, 4),
            max_queue_depth: 256,
            hard_timeout_ms: 5 * 60 * 1000,
            cancel_grace_ms: 2_000,
            max_transient_retries: 3,
            retry_backoff: BackoffConfig::default(),
            repository_backoff: BackoffConfig::new(50, 10_000),
            persistence: PersistencePolicy::Durable,
            timeout_policy: TimeoutPolicy::SpanRetries,
            repository: RepositoryBackendConfig::InMemory,
            thread_stack_size: 8 * 1024 * 1024,
        }
    }
}

impl SchedulerConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency budget.
    #[must_use]
    pub const fn with_concurrency_budget(mut self, budget: usize) -> Self {
        self.concurrency_budget = budget;
        self
    }

    /// Set the maximum queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the default hard timeout.
    #[must_use]
    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the cancel grace period.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the transient retry budget.
    #[must_use]
    pub const fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    /// Set the transient retry backoff.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the repository retry backoff.
    #[must_use]
    pub const fn with_repository_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.repository_backoff = backoff;
        self
    }

    /// Set the persistence policy.
    #[must_use]
    pub const fn with_persistence(mut self, policy: PersistencePolicy) -> Self {
        self.persistence = policy;
        self
    }

    /// Set the timeout policy.
    #[must_use]
    pub const fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Set the repository backend.
    #[must_use]
    pub fn with_repository(mut self, repository: RepositoryBackendConfig) -> Self {
        self.repository = repository;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Default hard timeout as a duration.
    #[must_use]
    pub const fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    /// Cancel grace period as a duration.
    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency_budget == 0 {
            return Err("concurrency_budget must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.hard_timeout_ms == 0 {
            return Err("hard_timeout_ms must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        for (name, backoff) in [
            ("retry_backoff", &self.retry_backoff),
            ("repository_backoff", &self.repository_backoff),
        ] {
            if backoff.base_ms == 0 || backoff.max_ms < backoff.base_ms {
                return Err(format!("{name} needs 0 < base_ms <= max_ms"));
            }
        }
        if let RepositoryBackendConfig::File { path } = &self.repository {
            if path.as_os_str().is_empty() {
                return Err("file repository path must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `DEFERRED_SCHEDULER_*` environment variables,
    /// loading a `.env` file first if present. Unset variables keep defaults.
    ///
    /// # Errors
    ///
    /// Unparseable variable or validation message.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(v) = env_var("CONCURRENCY_BUDGET")? {
            cfg.concurrency_budget = v;
        }
        if let Some(v) = env_var("MAX_QUEUE_DEPTH")? {
            cfg.max_queue_depth = v;
        }
        if let Some(v) = env_var("HARD_TIMEOUT_MS")? {
            cfg.hard_timeout_ms = v;
        }
        if let Some(v) = env_var("CANCEL_GRACE_MS")? {
            cfg.cancel_grace_ms = v;
        }
        if let Some(v) = env_var("MAX_TRANSIENT_RETRIES")? {
            cfg.max_transient_retries = v;
        }
        if let Ok(policy) = env::var(format!("{ENV_PREFIX}PERSISTENCE")) {
            cfg.persistence = match policy.as_str() {
                "durable" => PersistencePolicy::Durable,
                "best_effort" => PersistencePolicy::BestEffort,
                other => return Err(format!("unknown persistence policy `{other}`")),
            };
        }
        if let Ok(policy) = env::var(format!("{ENV_PREFIX}TIMEOUT_POLICY")) {
            cfg.timeout_policy = match policy.as_str() {
                "span_retries" => TimeoutPolicy::SpanRetries,
                "per_attempt" => TimeoutPolicy::PerAttempt,
                other => return Err(format!("unknown timeout policy `{other}`")),
            };
        }
        if let Ok(path) = env::var(format!("{ENV_PREFIX}REPOSITORY_PATH")) {
            cfg.repository = RepositoryBackendConfig::File { path: path.into() };
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(None),
    }
}
