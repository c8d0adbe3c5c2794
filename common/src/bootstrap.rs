// Bootstrap utilities shared by the worker and scheduler binaries

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::config::Settings;
use crate::lock::{DistributedLock, StoreLock};
use crate::queue::JobQueue;
use crate::resilience::ResiliencePolicy;
use crate::storage::{KeyValueStore, RedisStore};
use crate::telemetry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Load and validate settings, then start logging and the metrics exporter
pub fn init_runtime(component: &str) -> Result<Settings> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        component = %component,
        redis_url = %settings.redis.url,
        namespace = %settings.redis.namespace,
        queue = %settings.queue.name,
        "Configuration loaded"
    );
    Ok(settings)
}

/// Connect the Redis-backed store
#[tracing::instrument(skip(settings))]
pub async fn init_redis_store(settings: &Settings) -> Result<RedisStore> {
    info!("Connecting to Redis");
    let store = RedisStore::connect(&settings.redis)
        .await
        .context("Failed to connect to Redis")?;
    store
        .pool()
        .health_check()
        .await
        .context("Redis health check failed")?;
    info!("Redis connection established");
    Ok(store)
}

/// Queue configured from settings, exponential retry backoff included
pub fn init_queue(settings: &Settings, store: Arc<dyn KeyValueStore>) -> Arc<JobQueue> {
    Arc::new(JobQueue::new(store, &settings.queue))
}

pub fn init_lock(settings: &Settings, store: Arc<dyn KeyValueStore>) -> Arc<dyn DistributedLock> {
    Arc::new(StoreLock::from_config(store, &settings.lock))
}

/// Handler policy named after the queue, breakers shared through `registry`
pub fn init_policy(settings: &Settings, registry: &CircuitBreakerRegistry) -> ResiliencePolicy {
    ResiliencePolicy::from_config(&settings.queue.name, &settings.resilience, registry)
}

pub fn init_breaker_registry(settings: &Settings) -> CircuitBreakerRegistry {
    CircuitBreakerRegistry::new(CircuitBreakerConfig::from(&settings.resilience))
}
