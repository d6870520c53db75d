//! Orchestrator configuration.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `DISPATCH_*` environment variables. The CLI applies its flags last and
//! re-validates.
//!
//! # YAML layout
//!
//! Durations are integer milliseconds. Every field is optional.
//!
//! ```yaml
//! redis_url: redis://127.0.0.1:6379
//! report_interval_ms: 3600000
//! queue:
//!   max_queue_size: 1000
//!   max_wait_ms: 300000
//!   persistence_enabled: true
//! supervisor:
//!   max_parallel_jobs: 40
//!   retry_delay_ms: 5000
//! slots:
//!   max_slots: 10
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::scheduler::{QueueConfig, SlotOptimizerConfig, SupervisorConfig, WorkerPoolConfig, DEFAULT_EVENT_CAPACITY};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading or writing configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this layout.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub pool: WorkerPoolConfig,
    pub supervisor: SupervisorConfig,
    pub slots: SlotOptimizerConfig,
    /// Redis connection URL for queue persistence.
    pub redis_url: String,
    /// Events buffered per event bus subscriber.
    pub event_capacity: usize,
    /// Interval between summary reports.
    pub report_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            pool: WorkerPoolConfig::default(),
            supervisor: SupervisorConfig::default(),
            slots: SlotOptimizerConfig::default(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            report_interval: Duration::from_secs(3600), // hourly
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then `path` if given, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// environment variable is malformed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` or `ConfigError::Yaml`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Parses YAML over the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        let mut config = Self::default();
        file.apply(&mut config);
        Ok(config)
    }

    /// Creates configuration from defaults and environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `DISPATCH_REDIS_URL`: Redis URL for persistence
    /// - `DISPATCH_MAX_QUEUE_SIZE`: Queue capacity (default: 1000)
    /// - `DISPATCH_MAX_WAIT_SECS`: Default job max-wait (default: 300)
    /// - `DISPATCH_PERSISTENCE`: Mirror the queue to Redis (default: false)
    /// - `DISPATCH_KEY_PREFIX`: Redis key prefix (default: dispatch)
    /// - `DISPATCH_MAX_WORKERS`: Worker limit (default: 100)
    /// - `DISPATCH_HEARTBEAT_TIMEOUT_SECS`: Heartbeat timeout (default: 300)
    /// - `DISPATCH_MAX_PARALLEL_JOBS`: Parallel job limit (default: 40)
    /// - `DISPATCH_POLL_INTERVAL_SECS`: Polling interval (default: 30)
    /// - `DISPATCH_MAX_RETRIES`: Retry ceiling (default: 3)
    /// - `DISPATCH_RETRY_DELAY_SECS`: Base retry delay (default: 5)
    /// - `DISPATCH_AWAIT_COMPLETION`: Poll runs to completion (default: true)
    /// - `DISPATCH_DEFAULT_REF`: Default git ref (default: main)
    /// - `DISPATCH_MAX_SLOTS`: Execution slots (default: 10)
    /// - `DISPATCH_TARGET_UTILIZATION`: Slot utilization target (default: 0.95)
    /// - `DISPATCH_REPORT_INTERVAL_SECS`: Report interval (default: 3600)
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("DISPATCH_REDIS_URL") {
            self.redis_url = val;
        }

        // Queue settings
        if let Some(val) = lookup("DISPATCH_MAX_QUEUE_SIZE") {
            self.queue.max_queue_size = parse_env_value(&val, "DISPATCH_MAX_QUEUE_SIZE")?;
        }
        if let Some(val) = lookup("DISPATCH_MAX_WAIT_SECS") {
            self.queue.max_wait = parse_env_secs(&val, "DISPATCH_MAX_WAIT_SECS")?;
        }
        if let Some(val) = lookup("DISPATCH_PERSISTENCE") {
            self.queue.persistence_enabled = parse_env_bool(&val, "DISPATCH_PERSISTENCE")?;
        }
        if let Some(val) = lookup("DISPATCH_KEY_PREFIX") {
            self.queue.key_prefix = val;
        }

        // Pool settings
        if let Some(val) = lookup("DISPATCH_MAX_WORKERS") {
            self.pool.max_workers = parse_env_value(&val, "DISPATCH_MAX_WORKERS")?;
        }
        if let Some(val) = lookup("DISPATCH_HEARTBEAT_TIMEOUT_SECS") {
            self.pool.heartbeat_timeout = parse_env_secs(&val, "DISPATCH_HEARTBEAT_TIMEOUT_SECS")?;
        }

        // Supervisor settings
        if let Some(val) = lookup("DISPATCH_MAX_PARALLEL_JOBS") {
            self.supervisor.max_parallel_jobs = parse_env_value(&val, "DISPATCH_MAX_PARALLEL_JOBS")?;
        }
        if let Some(val) = lookup("DISPATCH_POLL_INTERVAL_SECS") {
            self.supervisor.polling_interval = parse_env_secs(&val, "DISPATCH_POLL_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("DISPATCH_MAX_RETRIES") {
            self.supervisor.max_retries = parse_env_value(&val, "DISPATCH_MAX_RETRIES")?;
        }
        if let Some(val) = lookup("DISPATCH_RETRY_DELAY_SECS") {
            self.supervisor.retry_delay = parse_env_secs(&val, "DISPATCH_RETRY_DELAY_SECS")?;
        }
        if let Some(val) = lookup("DISPATCH_AWAIT_COMPLETION") {
            self.supervisor.await_completion = parse_env_bool(&val, "DISPATCH_AWAIT_COMPLETION")?;
        }
        if let Some(val) = lookup("DISPATCH_DEFAULT_REF") {
            self.supervisor.default_ref = val;
        }

        // Slot settings
        if let Some(val) = lookup("DISPATCH_MAX_SLOTS") {
            self.slots.max_slots = parse_env_value(&val, "DISPATCH_MAX_SLOTS")?;
        }
        if let Some(val) = lookup("DISPATCH_TARGET_UTILIZATION") {
            self.slots.target_utilization = parse_env_value(&val, "DISPATCH_TARGET_UTILIZATION")?;
        }

        if let Some(val) = lookup("DISPATCH_REPORT_INTERVAL_SECS") {
            self.report_interval = parse_env_secs(&val, "DISPATCH_REPORT_INTERVAL_SECS")?;
        }

        Ok(())
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Queue validation
        if self.queue.max_queue_size == 0 {
            return Err(invalid("queue.max_queue_size must be greater than 0"));
        }
        if self.queue.max_wait.is_zero() {
            return Err(invalid("queue.max_wait must be greater than 0"));
        }
        if self.queue.cleanup_interval.is_zero() {
            return Err(invalid("queue.cleanup_interval must be greater than 0"));
        }
        if self.queue.persistence_enabled && self.queue.key_prefix.trim().is_empty() {
            return Err(invalid("queue.key_prefix cannot be empty when persistence is enabled"));
        }

        // Pool validation
        if self.pool.max_workers == 0 {
            return Err(invalid("pool.max_workers must be greater than 0"));
        }
        if self.pool.heartbeat_timeout.is_zero() {
            return Err(invalid("pool.heartbeat_timeout must be greater than 0"));
        }
        if self.pool.health_check_interval.is_zero() {
            return Err(invalid("pool.health_check_interval must be greater than 0"));
        }
        if self.pool.default_max_concurrent_jobs == 0 {
            return Err(invalid("pool.default_max_concurrent_jobs must be greater than 0"));
        }

        // Supervisor validation
        let sup = &self.supervisor;
        if sup.max_parallel_jobs == 0 {
            return Err(invalid("supervisor.max_parallel_jobs must be greater than 0"));
        }
        if sup.polling_interval.is_zero() {
            return Err(invalid("supervisor.polling_interval must be greater than 0"));
        }
        if sup.retry_delay.is_zero() {
            return Err(invalid("supervisor.retry_delay must be greater than 0"));
        }
        if !sup.retry_policy().fits_ceiling() {
            return Err(invalid(
                "supervisor.max_retry_delay must be at least retry_delay * 2^(max_retries - 1)",
            ));
        }
        if sup.await_completion && (sup.completion_max_attempts == 0 || sup.completion_poll_interval.is_zero()) {
            return Err(invalid(
                "supervisor completion wait needs at least one attempt and a non-zero interval",
            ));
        }
        if sup.history_limit == 0 {
            return Err(invalid("supervisor.history_limit must be greater than 0"));
        }
        if sup.default_ref.trim().is_empty() {
            return Err(invalid("supervisor.default_ref cannot be empty"));
        }
        if sup.default_capabilities.is_empty() {
            return Err(invalid("supervisor.default_capabilities cannot be empty"));
        }
        if sup.default_max_concurrent_jobs == 0 {
            return Err(invalid("supervisor.default_max_concurrent_jobs must be greater than 0"));
        }

        // Slot validation
        let slots = &self.slots;
        if slots.max_slots == 0 {
            return Err(invalid("slots.max_slots must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&slots.target_utilization) {
            return Err(invalid("slots.target_utilization must be between 0.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&slots.min_utilization) {
            return Err(invalid("slots.min_utilization must be between 0.0 and 1.0"));
        }
        if slots.min_utilization > slots.target_utilization {
            return Err(invalid("slots.min_utilization cannot exceed target_utilization"));
        }
        if slots.sample_interval.is_zero() {
            return Err(invalid("slots.sample_interval must be greater than 0"));
        }
        if slots.history_limit == 0 {
            return Err(invalid("slots.history_limit must be greater than 0"));
        }
        if slots.cost_per_minute < 0.0 {
            return Err(invalid("slots.cost_per_minute cannot be negative"));
        }
        if slots.bundle_size == 0 {
            return Err(invalid("slots.bundle_size must be greater than 0"));
        }

        // Top-level validation
        if self.queue.persistence_enabled && self.redis_url.trim().is_empty() {
            return Err(invalid("redis_url cannot be empty when persistence is enabled"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity must be greater than 0"));
        }
        if self.report_interval.is_zero() {
            return Err(invalid("report_interval must be greater than 0"));
        }

        Ok(())
    }

    /// Renders the configuration in the file layout.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&ConfigFile::from(self))?)
    }

    /// Writes the configuration to `path` in the file layout.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Builder method to set the queue section.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Builder method to set the pool section.
    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Builder method to set the supervisor section.
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Builder method to set the slot optimizer section.
    pub fn with_slots(mut self, slots: SlotOptimizerConfig) -> Self {
        self.slots = slots;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the report interval.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationFailed(message.to_string())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

fn millis(duration: Duration) -> Option<u64> {
    Some(duration.as_millis() as u64)
}

fn set_ms(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

// ----------------------------------------------------------------------------
// File layout
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    redis_url: Option<String>,
    event_capacity: Option<usize>,
    report_interval_ms: Option<u64>,
    queue: QueueSection,
    pool: PoolSection,
    supervisor: SupervisorSection,
    slots: SlotsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct QueueSection {
    max_queue_size: Option<usize>,
    max_wait_ms: Option<u64>,
    cleanup_interval_ms: Option<u64>,
    persistence_enabled: Option<bool>,
    key_prefix: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PoolSection {
    max_workers: Option<usize>,
    heartbeat_timeout_ms: Option<u64>,
    health_check_interval_ms: Option<u64>,
    default_max_concurrent_jobs: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SupervisorSection {
    max_parallel_jobs: Option<usize>,
    polling_interval_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    max_retry_delay_ms: Option<u64>,
    await_completion: Option<bool>,
    completion_poll_interval_ms: Option<u64>,
    completion_max_attempts: Option<u32>,
    high_queue_threshold: Option<usize>,
    low_workers_threshold: Option<usize>,
    history_limit: Option<usize>,
    default_ref: Option<String>,
    default_capabilities: Option<Vec<String>>,
    default_max_concurrent_jobs: Option<usize>,
    heartbeat_repositories: Option<bool>,
    shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SlotsSection {
    max_slots: Option<usize>,
    target_utilization: Option<f64>,
    min_utilization: Option<f64>,
    sample_interval_ms: Option<u64>,
    history_limit: Option<usize>,
    cost_per_minute: Option<f64>,
    bundle_size: Option<usize>,
    default_job_duration_ms: Option<u64>,
}

impl ConfigFile {
    fn apply(self, config: &mut OrchestratorConfig) {
        set(&mut config.redis_url, self.redis_url);
        set(&mut config.event_capacity, self.event_capacity);
        set_ms(&mut config.report_interval, self.report_interval_ms);

        let q = self.queue;
        set(&mut config.queue.max_queue_size, q.max_queue_size);
        set_ms(&mut config.queue.max_wait, q.max_wait_ms);
        set_ms(&mut config.queue.cleanup_interval, q.cleanup_interval_ms);
        set(&mut config.queue.persistence_enabled, q.persistence_enabled);
        set(&mut config.queue.key_prefix, q.key_prefix);

        let p = self.pool;
        set(&mut config.pool.max_workers, p.max_workers);
        set_ms(&mut config.pool.heartbeat_timeout, p.heartbeat_timeout_ms);
        set_ms(&mut config.pool.health_check_interval, p.health_check_interval_ms);
        set(&mut config.pool.default_max_concurrent_jobs, p.default_max_concurrent_jobs);

        let s = self.supervisor;
        let sup = &mut config.supervisor;
        set(&mut sup.max_parallel_jobs, s.max_parallel_jobs);
        set_ms(&mut sup.polling_interval, s.polling_interval_ms);
        set(&mut sup.max_retries, s.max_retries);
        set_ms(&mut sup.retry_delay, s.retry_delay_ms);
        set_ms(&mut sup.max_retry_delay, s.max_retry_delay_ms);
        set(&mut sup.await_completion, s.await_completion);
        set_ms(&mut sup.completion_poll_interval, s.completion_poll_interval_ms);
        set(&mut sup.completion_max_attempts, s.completion_max_attempts);
        set(&mut sup.high_queue_threshold, s.high_queue_threshold);
        set(&mut sup.low_workers_threshold, s.low_workers_threshold);
        set(&mut sup.history_limit, s.history_limit);
        set(&mut sup.default_ref, s.default_ref);
        set(&mut sup.default_capabilities, s.default_capabilities);
        set(&mut sup.default_max_concurrent_jobs, s.default_max_concurrent_jobs);
        set(&mut sup.heartbeat_repositories, s.heartbeat_repositories);
        set_ms(&mut sup.shutdown_timeout, s.shutdown_timeout_ms);

        let sl = self.slots;
        let slots = &mut config.slots;
        set(&mut slots.max_slots, sl.max_slots);
        set(&mut slots.target_utilization, sl.target_utilization);
        set(&mut slots.min_utilization, sl.min_utilization);
        set_ms(&mut slots.sample_interval, sl.sample_interval_ms);
        set(&mut slots.history_limit, sl.history_limit);
        set(&mut slots.cost_per_minute, sl.cost_per_minute);
        set(&mut slots.bundle_size, sl.bundle_size);
        set_ms(&mut slots.default_job_duration, sl.default_job_duration_ms);
    }
}

impl From<&OrchestratorConfig> for ConfigFile {
    fn from(config: &OrchestratorConfig) -> Self {
        let sup = &config.supervisor;
        let slots = &config.slots;
        Self {
            redis_url: Some(config.redis_url.clone()),
            event_capacity: Some(config.event_capacity),
            report_interval_ms: millis(config.report_interval),
            queue: QueueSection {
                max_queue_size: Some(config.queue.max_queue_size),
                max_wait_ms: millis(config.queue.max_wait),
                cleanup_interval_ms: millis(config.queue.cleanup_interval),
                persistence_enabled: Some(config.queue.persistence_enabled),
                key_prefix: Some(config.queue.key_prefix.clone()),
            },
            pool: PoolSection {
                max_workers: Some(config.pool.max_workers),
                heartbeat_timeout_ms: millis(config.pool.heartbeat_timeout),
                health_check_interval_ms: millis(config.pool.health_check_interval),
                default_max_concurrent_jobs: Some(config.pool.default_max_concurrent_jobs),
            },
            supervisor: SupervisorSection {
                max_parallel_jobs: Some(sup.max_parallel_jobs),
                polling_interval_ms: millis(sup.polling_interval),
                max_retries: Some(sup.max_retries),
                retry_delay_ms: millis(sup.retry_delay),
                max_retry_delay_ms: millis(sup.max_retry_delay),
                await_completion: Some(sup.await_completion),
                completion_poll_interval_ms: millis(sup.completion_poll_interval),
                completion_max_attempts: Some(sup.completion_max_attempts),
                high_queue_threshold: Some(sup.high_queue_threshold),
                low_workers_threshold: Some(sup.low_workers_threshold),
                history_limit: Some(sup.history_limit),
                default_ref: Some(sup.default_ref.clone()),
                default_capabilities: Some(sup.default_capabilities.clone()),
                default_max_concurrent_jobs: Some(sup.default_max_concurrent_jobs),
                heartbeat_repositories: Some(sup.heartbeat_repositories),
                shutdown_timeout_ms: millis(sup.shutdown_timeout),
            },
            slots: SlotsSection {
                max_slots: Some(slots.max_slots),
                target_utilization: Some(slots.target_utilization),
                min_utilization: Some(slots.min_utilization),
                sample_interval_ms: millis(slots.sample_interval),
                history_limit: Some(slots.history_limit),
                cost_per_minute: Some(slots.cost_per_minute),
                bundle_size: Some(slots.bundle_size),
                default_job_duration_ms: millis(slots.default_job_duration),
            },
        }
    }
}
