// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
    pub resilience: ResilienceConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix applied to every key this service writes
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub prefix: String,
    /// How long `acquire_with_wait` keeps trying
    pub wait_seconds: u64,
    /// Lock hold time
    pub lease_seconds: u64,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub max_retries: u32,
    pub visibility_timeout_seconds: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
    pub completed_retention_seconds: u64,
    pub dequeue_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    pub circuit_window_size: usize,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_seconds: u64,
    pub circuit_half_open_max_calls: u32,
    pub time_limit_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub prefix: String,
    pub default_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub prefix: String,
    pub max_inactive_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Defaults to a random id per process
    pub worker_id: Option<String>,
    pub concurrency: u32,
    pub poll_interval_ms: u64,
    pub requeue_delay_ms: u64,
    pub event_channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub prewarm_interval_seconds: u64,
    pub prewarm_initial_delay_seconds: u64,
    pub prewarm_lock_ttl_seconds: u64,
    pub prewarm_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.redis.namespace.is_empty() {
            return Err("Redis namespace cannot be empty".to_string());
        }

        if self.lock.lease_seconds == 0 {
            return Err("Lock lease_seconds must be greater than 0".to_string());
        }

        if self.queue.name.is_empty() {
            return Err("Queue name cannot be empty".to_string());
        }
        if self.queue.visibility_timeout_seconds == 0 {
            return Err("Queue visibility_timeout_seconds must be greater than 0".to_string());
        }
        if self.queue.dequeue_batch == 0 {
            return Err("Queue dequeue_batch must be greater than 0".to_string());
        }
        if self.queue.backoff_multiplier < 1.0 {
            return Err("Queue backoff_multiplier must be at least 1.0".to_string());
        }

        if self.resilience.retry_max_attempts == 0 {
            return Err("Resilience retry_max_attempts must be greater than 0".to_string());
        }
        if self.resilience.circuit_window_size == 0 {
            return Err("Resilience circuit_window_size must be greater than 0".to_string());
        }
        if self.resilience.circuit_failure_threshold == 0
            || self.resilience.circuit_failure_threshold as usize
                > self.resilience.circuit_window_size
        {
            return Err(
                "Resilience circuit_failure_threshold must be between 1 and circuit_window_size"
                    .to_string(),
            );
        }
        if self.resilience.time_limit_ms == 0 {
            return Err("Resilience time_limit_ms must be greater than 0".to_string());
        }

        if self.cache.default_ttl_seconds == 0 {
            return Err("Cache default_ttl_seconds must be greater than 0".to_string());
        }
        if self.session.max_inactive_seconds == 0 {
            return Err("Session max_inactive_seconds must be greater than 0".to_string());
        }

        if self.worker.concurrency == 0 {
            return Err("Worker concurrency must be greater than 0".to_string());
        }
        if self.scheduler.prewarm_interval_seconds == 0 {
            return Err("Scheduler prewarm_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.prewarm_lock_ttl_seconds == 0 {
            return Err("Scheduler prewarm_lock_ttl_seconds must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl LockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.max(1))
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_seconds)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            namespace: "jobs".to_string(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: "lock:".to_string(),
            wait_seconds: 2,
            lease_seconds: 20,
            retry_delay_ms: 100,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_retries: 3,
            visibility_timeout_seconds: 30,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.1,
            completed_retention_seconds: 3_600,
            dequeue_batch: 16,
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
            retry_jitter: 0.3,
            circuit_window_size: 10,
            circuit_failure_threshold: 5,
            circuit_cooldown_seconds: 30,
            circuit_half_open_max_calls: 1,
            time_limit_ms: 5_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "cache".to_string(),
            default_ttl_seconds: 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: "session".to_string(),
            max_inactive_seconds: 1_800,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: 4,
            poll_interval_ms: 500,
            requeue_delay_ms: 1_000,
            event_channel: "notify".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prewarm_interval_seconds: 120,
            prewarm_initial_delay_seconds: 15,
            prewarm_lock_ttl_seconds: 20,
            prewarm_keys: vec!["seoul".to_string(), "busan".to_string(), "tokyo".to_string()],
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_redis_url() {
        let mut settings = Settings::default();
        settings.redis.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_threshold_above_window() {
        let mut settings = Settings::default();
        settings.resilience.circuit_failure_threshold = 11;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_concurrency() {
        let mut settings = Settings::default();
        settings.worker.concurrency = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_time_limit() {
        let mut settings = Settings::default();
        settings.resilience.time_limit_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.contains("time_limit_ms"));
    }

    #[test]
    fn test_validation_catches_zero_prewarm_lock_ttl() {
        let mut settings = Settings::default();
        settings.scheduler.prewarm_lock_ttl_seconds = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.contains("prewarm_lock_ttl_seconds"));
    }

    #[test]
    fn test_lock_lease_has_one_second_floor() {
        let lock = LockConfig {
            lease_seconds: 0,
            ..LockConfig::default()
        };
        assert_eq!(lock.lease(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_path_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            "[queue]\nname = \"emails\"\nmax_retries = 7\n\n[cache]\ndefault_ttl_seconds = 5"
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.queue.name, "emails");
        assert_eq!(settings.queue.max_retries, 7);
        assert_eq!(settings.cache.default_ttl_seconds, 5);
        // Untouched sections keep their defaults
        assert_eq!(settings.lock.prefix, "lock:");
        assert_eq!(settings.queue.visibility_timeout_seconds, 30);
    }
}
