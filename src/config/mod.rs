//! Configuration management for CLI, environment variables, and config files.

use crate::error::{CounterError, CounterResult, ValidationIssue};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Queue used for deletion jobs when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Main configuration for the sharded counter service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to size the random shard pick when the counter record can't be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardHintPolicy {
    /// Propagate the read failure and abort the mutation.
    #[default]
    Strict,
    /// Fall back to `num_initial_shards` and carry on.
    DefaultOnError,
}

/// Counter policy: shard sizing, deletion-queue routing, decrement limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub num_initial_shards: u32,
    pub delete_queue_name: Option<String>,
    pub delete_task_path: Option<String>,
    pub max_decrement_amount: u64,
    pub shard_hint_policy: ShardHintPolicy,
}

/// Configuration for the aggregate cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub count_ttl_secs: u64,
    pub max_entries: u64,
    pub cas_max_attempts: u32,
    pub key_prefix: String,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub transaction_attempts: u32,
}

/// Configuration for the deletion worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub channel_capacity: usize,
    /// Attempts per delivery before the job is put back for later
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Delay before a job that exhausted its attempts is delivered again
    pub redelivery_delay_ms: u64,
}

/// Configuration for logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub metrics_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            num_initial_shards: 1,
            delete_queue_name: None,
            delete_task_path: None,
            max_decrement_amount: 1,
            shard_hint_policy: ShardHintPolicy::Strict,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count_ttl_secs: 60,
            max_entries: 10_000,
            cas_max_attempts: 20,
            key_prefix: String::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            transaction_attempts: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            max_attempts: 5,
            retry_backoff_ms: 100,
            redelivery_delay_ms: 1_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            metrics_interval_secs: 0,
        }
    }
}

impl ServiceConfig {
    pub fn with_initial_shards(num_initial_shards: u32) -> Self {
        Self {
            num_initial_shards,
            ..Self::default()
        }
    }

    pub fn delete_queue(mut self, name: impl Into<String>) -> Self {
        self.delete_queue_name = Some(name.into());
        self
    }

    pub fn delete_task_path(mut self, path: impl Into<String>) -> Self {
        self.delete_task_path = Some(path.into());
        self
    }

    pub fn max_decrement(mut self, amount: u64) -> Self {
        self.max_decrement_amount = amount;
        self
    }

    pub fn shard_hint_policy(mut self, policy: ShardHintPolicy) -> Self {
        self.shard_hint_policy = policy;
        self
    }

    /// Queue that deletion jobs are routed to.
    pub fn queue_name(&self) -> &str {
        self.delete_queue_name
            .as_deref()
            .unwrap_or(DEFAULT_QUEUE_NAME)
    }

    fn collect_issues(&self, issues: &mut Vec<ValidationIssue>) {
        if self.num_initial_shards == 0 {
            issues.push(ValidationIssue {
                field: "service.num_initial_shards".to_string(),
                message: "Number of shards for a new counter must be greater than 0".to_string(),
            });
        }
        if let Some(name) = &self.delete_queue_name {
            if name.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: "service.delete_queue_name".to_string(),
                    message: "Must be unset (for the default queue) or non-blank".to_string(),
                });
            }
        }
        if let Some(path) = &self.delete_task_path {
            if path.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: "service.delete_task_path".to_string(),
                    message: "Must be unset or non-blank".to_string(),
                });
            }
        }
        if self.max_decrement_amount == 0 {
            issues.push(ValidationIssue {
                field: "service.max_decrement_amount".to_string(),
                message: "Must allow decrementing at least 1".to_string(),
            });
        }
    }

    pub fn validate(&self) -> CounterResult<()> {
        let mut issues = Vec::new();
        self.collect_issues(&mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(CounterError::ValidationError(issues))
        }
    }
}

impl CacheConfig {
    pub fn count_ttl(&self) -> Duration {
        Duration::from_secs(self.count_ttl_secs)
    }
}

impl WorkerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> CounterResult<T> {
    value
        .parse()
        .map_err(|_| CounterError::InvalidArgument(format!("{} has invalid format", var)))
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &PathBuf) -> CounterResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| CounterError::IoError(e.to_string()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| CounterError::ParseError(e.to_string())),
            _ => toml::from_str(&content).map_err(|e| CounterError::ParseError(e.to_string())),
        }
    }

    pub fn from_default_locations() -> CounterResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|d| d.join("sharded-counter/config.toml")),
            Some(PathBuf::from("/etc/sharded-counter/config.toml")),
            Some(PathBuf::from("./sharded-counter.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn merge_from_env(mut self) -> CounterResult<Self> {
        const INITIAL_SHARDS: &str = "SHARDED_COUNTER_INITIAL_SHARDS";
        const DELETE_QUEUE: &str = "SHARDED_COUNTER_DELETE_QUEUE";
        const DELETE_TASK_PATH: &str = "SHARDED_COUNTER_DELETE_TASK_PATH";
        const MAX_DECREMENT: &str = "SHARDED_COUNTER_MAX_DECREMENT";
        const CACHE_ENABLED: &str = "SHARDED_COUNTER_CACHE_ENABLED";
        const CACHE_TTL: &str = "SHARDED_COUNTER_CACHE_TTL";
        const CAS_ATTEMPTS: &str = "SHARDED_COUNTER_CAS_ATTEMPTS";
        const TXN_ATTEMPTS: &str = "SHARDED_COUNTER_TXN_ATTEMPTS";
        const LOG_LEVEL: &str = "SHARDED_COUNTER_LOG_LEVEL";

        if let Ok(val) = std::env::var(INITIAL_SHARDS) {
            self.service.num_initial_shards = parse_env(INITIAL_SHARDS, &val)?;
        }
        if let Ok(val) = std::env::var(DELETE_QUEUE) {
            self.service.delete_queue_name = Some(val);
        }
        if let Ok(val) = std::env::var(DELETE_TASK_PATH) {
            self.service.delete_task_path = Some(val);
        }
        if let Ok(val) = std::env::var(MAX_DECREMENT) {
            self.service.max_decrement_amount = parse_env(MAX_DECREMENT, &val)?;
        }
        if let Ok(val) = std::env::var(CACHE_ENABLED) {
            self.cache.enabled = parse_env(CACHE_ENABLED, &val)?;
        }
        if let Ok(val) = std::env::var(CACHE_TTL) {
            self.cache.count_ttl_secs = parse_env(CACHE_TTL, &val)?;
        }
        if let Ok(val) = std::env::var(CAS_ATTEMPTS) {
            self.cache.cas_max_attempts = parse_env(CAS_ATTEMPTS, &val)?;
        }
        if let Ok(val) = std::env::var(TXN_ATTEMPTS) {
            self.store.transaction_attempts = parse_env(TXN_ATTEMPTS, &val)?;
        }
        if let Ok(val) = std::env::var(LOG_LEVEL) {
            self.logging.level = val;
        }

        Ok(self)
    }

    pub fn merge_from_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(shards) = cli.initial_shards {
            self.service.num_initial_shards = shards;
        }

        if let Some(ref queue) = cli.delete_queue {
            self.service.delete_queue_name = Some(queue.clone());
        }

        if cli.no_cache {
            self.cache.enabled = false;
        }

        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }

        self
    }

    pub fn load() -> CounterResult<Self> {
        Self::from_default_locations()?.merge_from_env()
    }

    pub fn load_with_cli(cli: &CliArgs) -> CounterResult<Self> {
        let base = match cli.config_file {
            Some(ref path) => Self::from_file(path)?,
            None => Self::from_default_locations()?,
        };
        Ok(base.merge_from_env()?.merge_from_cli(cli))
    }

    pub fn validate(&self) -> CounterResult<()> {
        let mut issues = Vec::new();

        self.service.collect_issues(&mut issues);

        if self.cache.cas_max_attempts == 0 {
            issues.push(ValidationIssue {
                field: "cache.cas_max_attempts".to_string(),
                message: "At least one compare-and-swap attempt is required".to_string(),
            });
        }
        if self.cache.enabled && self.cache.count_ttl_secs == 0 {
            issues.push(ValidationIssue {
                field: "cache.count_ttl_secs".to_string(),
                message: "Cached aggregates need a TTL greater than 0".to_string(),
            });
        }
        if self.store.transaction_attempts == 0 {
            issues.push(ValidationIssue {
                field: "store.transaction_attempts".to_string(),
                message: "At least one transaction attempt is required".to_string(),
            });
        }
        if self.worker.channel_capacity == 0 {
            issues.push(ValidationIssue {
                field: "worker.channel_capacity".to_string(),
                message: "Channel capacity must be greater than 0".to_string(),
            });
        }
        if self.worker.max_attempts == 0 {
            issues.push(ValidationIssue {
                field: "worker.max_attempts".to_string(),
                message: "At least one delivery attempt is required".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            issues.push(ValidationIssue {
                field: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CounterError::ValidationError(issues))
        }
    }
}

/// Command-line arguments that override configuration values.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_file: Option<PathBuf>,
    pub initial_shards: Option<u32>,
    pub delete_queue: Option<String>,
    pub no_cache: bool,
    pub log_level: Option<String>,
}
