//! Configuration types for Dockhand.
//!
//! This module contains all configuration structures used throughout Dockhand,
//! including worker pool settings, broker polling, rate limiting, metrics and
//! the HTTP endpoint.

use crate::error::{DockhandError, DockhandResult};
use crate::queue::registry::QueueBinding;
use crate::task::TaskErrorKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Dockhand worker.
///
/// # Examples
///
/// ```rust
/// use dockhand::config::{DockhandConfig, WorkerConfig};
///
/// let config = DockhandConfig {
///     env: "stage".to_string(),
///     worker: WorkerConfig::with_concurrency(8).with_prefetch_multiplier(1),
///     ..Default::default()
/// };
/// assert_eq!(config.worker.prefetch_count(), 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockhandConfig {
    /// Worker name, also used as the metrics prefix when none is set
    pub name: String,

    /// Deployment environment: local, dev, stage or prod.
    /// Prepended to every physical queue name.
    pub env: String,

    /// Queue to task bindings
    pub queues: Vec<QueueBinding>,

    /// Worker pool configuration
    pub worker: WorkerConfig,

    /// Broker polling configuration
    pub broker: BrokerConfig,

    /// Rate-limit decision service configuration
    pub ratelimit: RateLimitConfig,

    /// Retry policy used by tasks that opt in without their own policy
    pub retry: RetryPolicy,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Status and metrics HTTP endpoint
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for DockhandConfig {
    fn default() -> Self {
        Self {
            name: "dockhand".to_string(),
            env: "local".to_string(),
            queues: Vec::new(),
            worker: WorkerConfig::default(),
            broker: BrokerConfig::default(),
            ratelimit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            metrics: MetricsConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of tasks executed concurrently
    pub concurrency: usize,

    /// Messages fetched per poll are `concurrency * prefetch_multiplier`
    pub prefetch_multiplier: usize,

    /// Maximum time a task can run before it is revoked (in seconds)
    pub task_timeout_secs: Option<u64>,

    /// Time in-flight tasks get to drain on shutdown (in seconds)
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            prefetch_multiplier: 2,
            task_timeout_secs: Some(300), // 5 minutes
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the prefetch multiplier.
    pub fn with_prefetch_multiplier(mut self, multiplier: usize) -> Self {
        self.prefetch_multiplier = multiplier;
        self
    }

    /// Set the task timeout.
    pub fn with_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace_secs: u64) -> Self {
        self.shutdown_grace_secs = grace_secs;
        self
    }

    /// Number of unacknowledged messages this worker may hold.
    pub fn prefetch_count(&self) -> usize {
        self.concurrency.saturating_mul(self.prefetch_multiplier).max(1)
    }
}

/// Broker polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Sleep between polls of a queue that was skipped or came back empty (in milliseconds)
    pub polling_interval_ms: u64,

    /// Long-poll wait passed to the transport (in seconds)
    pub wait_time_secs: u64,

    /// Hard cap on messages per fetch imposed by the transport
    pub max_batch_size: usize,

    /// Capacity of the channel feeding fetched messages to the worker pool
    pub channel_capacity: usize,

    /// How long a fetched message stays invisible before the transport
    /// redelivers it (in seconds). Must outlast every attempt of a task
    /// plus its retry backoff, see [`DockhandConfig::message_hold_budget`].
    pub visibility_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 1000,
            wait_time_secs: 15,
            max_batch_size: 10,
            channel_capacity: 100,
            visibility_timeout_secs: 3600,
        }
    }
}

impl BrokerConfig {
    /// Set the polling interval.
    pub fn with_polling_interval(mut self, interval_ms: u64) -> Self {
        self.polling_interval_ms = interval_ms;
        self
    }

    /// Set the long-poll wait time.
    pub fn with_wait_time(mut self, wait_secs: u64) -> Self {
        self.wait_time_secs = wait_secs;
        self
    }

    /// Set the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout_secs: u64) -> Self {
        self.visibility_timeout_secs = timeout_secs;
        self
    }

    /// Visibility timeout as a [`Duration`].
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Rate-limit decision service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Decision endpoint, e.g. `http://ratelimit.service.consul:8080/json`
    pub url: String,

    /// Rate-limit domain. An empty domain disables rate limiting.
    pub domain: String,

    /// Key used for queues bound without one. `None` leaves those queues unthrottled.
    pub default_key: Option<String>,

    /// Timeout of a single decision request (in milliseconds)
    pub request_timeout_ms: u64,

    /// Hard ceiling for a whole decision including retries (in milliseconds)
    pub decision_ceiling_ms: u64,

    /// Attempts per decision
    pub max_attempts: u32,

    /// Backoff before the first retry, doubled per attempt (in milliseconds)
    pub backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            url: "http://ratelimit.service.consul:8080/json".to_string(),
            domain: String::new(),
            default_key: None,
            request_timeout_ms: 500,
            decision_ceiling_ms: 500,
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration for the given endpoint and domain.
    pub fn new(url: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Whether a decision service should be consulted at all.
    pub fn is_enabled(&self) -> bool {
        !self.domain.is_empty()
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Whether to enable jitter in delay calculations
    pub enable_jitter: bool,

    /// Error kinds worth retrying; anything else fails immediately
    pub retry_on: Vec<TaskErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,  // 1 second
            max_delay_ms: 600000, // 10 minutes
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            enable_jitter: true,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
            enable_jitter: false,
            retry_on: Vec::new(),
        }
    }

    /// Disable retries completely.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retry only on the given error kinds.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = TaskErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Whether an error of `kind` after `retries_done` retries gets another attempt.
    pub fn should_retry(&self, kind: TaskErrorKind, retries_done: u32) -> bool {
        retries_done < self.max_retries && self.retry_on.contains(&kind)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        crate::utils::retry_delay(self, retry)
    }

    /// Retries a failing task can actually get. A policy that retries on
    /// no error kind never retries.
    pub fn effective_retries(&self) -> u32 {
        if self.retry_on.is_empty() {
            0
        } else {
            self.max_retries
        }
    }

    /// Upper bound of all backoff sleeps of one task, jitter included.
    pub fn max_total_delay(&self) -> Duration {
        crate::utils::max_total_delay(self, self.effective_retries())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Metric name prefix. Defaults to the worker name when empty.
    pub prefix: String,

    /// Buckets for the runtime histogram (in seconds)
    pub runtime_buckets: Vec<f64>,

    /// Buckets for the latency histogram (in seconds)
    pub latency_buckets: Vec<f64>,

    /// Shared directory where every worker process drops its snapshot
    pub multiproc_dir: Option<PathBuf>,

    /// Snapshot flush interval (in seconds)
    pub flush_interval_secs: u64,

    /// Remove the multiprocess directory when the worker exits
    pub cleanup_on_exit: bool,
}

/// Default histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            runtime_buckets: DEFAULT_BUCKETS.to_vec(),
            latency_buckets: DEFAULT_BUCKETS.to_vec(),
            multiproc_dir: None,
            flush_interval_secs: 10,
            cleanup_on_exit: false,
        }
    }
}

/// Status and metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether to serve `/status` and `/metrics`
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl DockhandConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            env: "local".to_string(),
            worker: WorkerConfig {
                concurrency: 2,
                task_timeout_secs: Some(60),
                ..Default::default()
            },
            broker: BrokerConfig {
                polling_interval_ms: 500,
                wait_time_secs: 5,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            env: "prod".to_string(),
            worker: WorkerConfig {
                concurrency: num_cpus::get() * 2,
                task_timeout_secs: Some(300),
                shutdown_grace_secs: 60,
                ..Default::default()
            },
            broker: BrokerConfig {
                polling_interval_ms: 30000,
                wait_time_secs: 15,
                ..Default::default()
            },
            metrics: MetricsConfig {
                multiproc_dir: Some(PathBuf::from("./prometheus_multiproc_dir")),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            env: "test".to_string(),
            worker: WorkerConfig {
                concurrency: 1,
                prefetch_multiplier: 1,
                task_timeout_secs: Some(10),
                shutdown_grace_secs: 5,
            },
            broker: BrokerConfig {
                polling_interval_ms: 10,
                wait_time_secs: 0,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(1, 10),
            server: ServerConfig {
                enabled: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> DockhandResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DockhandError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Override selected fields from the process environment.
    ///
    /// Reads `DOCKHAND_ENV`, `DOCKHAND_PORT` and `PROMETHEUS_MULTIPROC_DIR`.
    pub fn apply_env(mut self) -> DockhandResult<Self> {
        if let Ok(env) = std::env::var("DOCKHAND_ENV") {
            self.env = env;
        }
        if let Ok(port) = std::env::var("DOCKHAND_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| DockhandError::config(format!("invalid DOCKHAND_PORT '{}'", port)))?;
        }
        if let Ok(dir) = std::env::var("PROMETHEUS_MULTIPROC_DIR") {
            self.metrics.multiproc_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    /// Metric name prefix, falling back to the worker name.
    pub fn metrics_prefix(&self) -> &str {
        if self.metrics.prefix.is_empty() {
            &self.name
        } else {
            &self.metrics.prefix
        }
    }

    /// Longest a worker can hold one message under `policy` before settling
    /// it, counted from the fetch. Every attempt may run into the task
    /// timeout with a backoff sleep in between, and a prefetched message may
    /// first wait behind `prefetch_multiplier - 1` such holds per worker.
    /// `None` when tasks run without a timeout.
    pub fn message_hold_budget(&self, policy: &RetryPolicy) -> Option<Duration> {
        let timeout = Duration::from_secs(self.worker.task_timeout_secs?);
        let attempts = policy.effective_retries().saturating_add(1);
        let hold = timeout
            .saturating_mul(attempts)
            .saturating_add(policy.max_total_delay());
        let queued = u32::try_from(self.worker.prefetch_multiplier.max(1)).unwrap_or(u32::MAX);
        Some(hold.saturating_mul(queued))
    }

    /// Check that messages stay invisible for longer than a worker can hold
    /// them under `policy`, so no message is redelivered while still running.
    pub fn check_visibility(
        &self,
        policy: &RetryPolicy,
        visibility: Duration,
    ) -> Result<(), String> {
        match self.message_hold_budget(policy) {
            Some(budget) if visibility <= budget => Err(format!(
                "Visibility timeout {:?} must exceed the task timeout plus retry backoff ({:?})",
                visibility, budget
            )),
            _ => Ok(()),
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.env.is_empty() {
            errors.push("Environment name must not be empty".to_string());
        }

        if self.worker.concurrency == 0 {
            errors.push("Worker concurrency must be greater than 0".to_string());
        }

        if self.worker.concurrency > 1000 {
            errors.push("Worker concurrency should not exceed 1000".to_string());
        }

        if self.worker.prefetch_multiplier == 0 {
            errors.push("Prefetch multiplier must be greater than 0".to_string());
        }

        if self.broker.max_batch_size == 0 {
            errors.push("Broker max batch size must be greater than 0".to_string());
        }

        if self.broker.channel_capacity == 0 {
            errors.push("Broker channel capacity must be greater than 0".to_string());
        }

        if let Err(e) = self.check_visibility(&self.retry, self.broker.visibility_timeout()) {
            errors.push(e);
        }

        if self.ratelimit.is_enabled() && self.ratelimit.max_attempts == 0 {
            errors.push("Rate limit attempts must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        for bucket in [&self.metrics.runtime_buckets, &self.metrics.latency_buckets] {
            if bucket.windows(2).any(|w| w[0] >= w[1]) {
                errors.push("Histogram buckets must be strictly increasing".to_string());
            }
        }

        for binding in &self.queues {
            if binding.short_name.is_empty() || binding.task_name.is_empty() {
                errors.push(format!(
                    "Queue binding '{}' -> '{}' must name both queue and task",
                    binding.short_name, binding.task_name
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DockhandConfig::default();
        assert!(config.worker.concurrency > 0);
        assert_eq!(config.broker.max_batch_size, 10);
        assert_eq!(config.ratelimit.request_timeout_ms, 500);
        assert!(!config.ratelimit.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = DockhandConfig::development();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.env, "local");
        assert!(matches!(config.logging.level, LogLevel::Debug));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_config() {
        let config = DockhandConfig::production();
        assert!(config.worker.concurrency >= 2);
        assert!(config.metrics.multiproc_dir.is_some());
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = DockhandConfig::testing();
        assert_eq!(config.worker.concurrency, 1);
        assert!(!config.server.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DockhandConfig::default();
        assert!(config.validate().is_ok());

        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        config.worker.concurrency = 1;
        config.broker.max_batch_size = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("batch size")));

        config.broker.max_batch_size = 10;
        config.metrics.runtime_buckets = vec![1.0, 0.5];
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("buckets")));
    }

    #[test]
    fn test_visibility_must_outlast_task_timeout() {
        let mut config = DockhandConfig::default();
        config.worker.prefetch_multiplier = 1;
        assert_eq!(config.broker.visibility_timeout(), Duration::from_secs(3600));

        config.broker.visibility_timeout_secs = 30;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Visibility timeout")));

        config.broker.visibility_timeout_secs = 300;
        assert!(config.validate().is_err(), "equal to the task timeout is not enough");

        config.broker.visibility_timeout_secs = 301;
        assert!(config.validate().is_ok());

        // A second prefetched message per worker may wait out a full hold first
        config.worker.prefetch_multiplier = 2;
        assert!(config.validate().is_err());
        config.broker.visibility_timeout_secs = 601;
        assert!(config.validate().is_ok());

        config.worker.task_timeout_secs = None;
        config.broker.visibility_timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_message_hold_budget_counts_retries() {
        let mut config = DockhandConfig::default();
        config.worker.task_timeout_secs = Some(10);
        config.worker.prefetch_multiplier = 1;

        let silent = RetryPolicy::fixed(5, 1000);
        assert_eq!(config.message_hold_budget(&silent), Some(Duration::from_secs(10)));

        let retrying = RetryPolicy::fixed(2, 1000).retry_on([TaskErrorKind::Io]);
        assert_eq!(config.message_hold_budget(&retrying), Some(Duration::from_secs(32)));

        let exponential = RetryPolicy::exponential(3).retry_on([TaskErrorKind::Io]);
        assert_eq!(exponential.max_total_delay(), Duration::from_secs(7));
        assert!(config.check_visibility(&exponential, Duration::from_secs(47)).is_err());
        assert!(config.check_visibility(&exponential, Duration::from_secs(48)).is_ok());

        config.worker.prefetch_multiplier = 3;
        assert_eq!(config.message_hold_budget(&retrying), Some(Duration::from_secs(96)));
    }

    #[test]
    fn test_prefetch_count() {
        let config = WorkerConfig::with_concurrency(4).with_prefetch_multiplier(2);
        assert_eq!(config.prefetch_count(), 8);

        let config = WorkerConfig::with_concurrency(4).with_prefetch_multiplier(0);
        assert_eq!(config.prefetch_count(), 1);
    }

    #[test]
    fn test_retry_policies() {
        let exponential = RetryPolicy::exponential(5).retry_on([TaskErrorKind::DivisionByZero]);
        assert_eq!(exponential.max_retries, 5);
        assert!(exponential.should_retry(TaskErrorKind::DivisionByZero, 4));
        assert!(!exponential.should_retry(TaskErrorKind::DivisionByZero, 5));
        assert!(!exponential.should_retry(TaskErrorKind::InvalidArguments, 0));

        let fixed = RetryPolicy::fixed(2, 1000);
        assert_eq!(fixed.base_delay_ms, 1000);
        assert!(matches!(fixed.backoff_strategy, BackoffStrategy::Fixed));

        let none = RetryPolicy::none();
        assert_eq!(none.max_retries, 0);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let raw = r#"{
            "env": "stage",
            "queues": [{"short_name": "add", "task_name": "add"}],
            "worker": {"concurrency": 4}
        }"#;
        let config: DockhandConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.env, "stage");
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].rate_limit_key, None);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.prefetch_multiplier, 2);
        assert_eq!(config.broker.wait_time_secs, 15);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{"name": "billing", "env": "dev"}"#).unwrap();

        let config = DockhandConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "billing");
        assert_eq!(config.metrics_prefix(), "billing");

        let missing = DockhandConfig::from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(DockhandError::ConfigError { .. })));
    }
}
