// Telemetry module for structured logging, metrics, and tracing

use crate::circuit_breaker::CircuitState;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const SERVICE_NAME: &str = "redis-jobs";

/// Initialize structured logging with JSON formatting and trace context
///
/// `RUST_LOG` takes precedence over `log_level`. Spans are exported over OTLP
/// when `tracing_endpoint` is set.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(), log_level)?;

    // Create JSON formatting layer with trace context
    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    // Initialize the subscriber with optional OpenTelemetry layer
    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        // Initialize OpenTelemetry if endpoint is provided
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Directives from `RUST_LOG` when it parses, otherwise `log_level`
fn env_filter(rust_log: Option<&str>, log_level: &str) -> Result<EnvFilter> {
    if let Some(filter) = rust_log.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return Ok(filter);
    }
    EnvFilter::try_new(log_level)
        .map_err(|e| anyhow::anyhow!("Failed to create env filter from '{}': {}", log_level, e))
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    // Create OTLP exporter
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    // Create tracer provider with resource attributes
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    // Set global tracer provider
    global::set_tracer_provider(tracer_provider.clone());

    // Get tracer
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider
///
/// This should be called on graceful shutdown to flush remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe every metric this crate records
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    // Build and install the Prometheus exporter
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("job_enqueued_total", "Total number of jobs enqueued");
    describe_counter!(
        "job_success_total",
        "Total number of successful job executions"
    );
    describe_counter!("job_failed_total", "Total number of failed job executions");
    describe_counter!(
        "job_dead_total",
        "Total number of jobs moved to the dead letter queue"
    );
    describe_counter!(
        "job_redelivered_total",
        "Total number of deliveries after an expired lease"
    );
    describe_histogram!(
        "job_duration_seconds",
        "Duration of job executions in seconds"
    );
    describe_gauge!("job_queue_size", "Current number of jobs in the ready set");
    describe_counter!(
        "lock_contention_total",
        "Lock acquisitions rejected because another holder owns the key"
    );
    describe_counter!("cache_hits_total", "Cache lookups served from the store");
    describe_counter!("cache_misses_total", "Cache lookups that found no fresh entry");
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)"
    );
    describe_counter!(
        "circuit_breaker_rejected_total",
        "Calls rejected by an open circuit breaker"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record a job being enqueued
#[inline]
pub fn record_job_enqueued(queue: &str) {
    counter!("job_enqueued_total", "queue" => queue.to_string()).increment(1);
}

/// Record a successful job execution
#[inline]
pub fn record_job_success(queue: &str) {
    counter!("job_success_total", "queue" => queue.to_string()).increment(1);
}

/// Record a failed job execution that will be retried
#[inline]
pub fn record_job_failure(queue: &str) {
    counter!("job_failed_total", "queue" => queue.to_string()).increment(1);
}

#[inline]
pub fn record_job_dead(queue: &str) {
    counter!("job_dead_total", "queue" => queue.to_string()).increment(1);
}

/// A job was claimed again after its previous lease expired
#[inline]
pub fn record_job_redelivered(queue: &str) {
    counter!("job_redelivered_total", "queue" => queue.to_string()).increment(1);
}

/// Record job execution duration
#[inline]
pub fn record_job_duration(queue: &str, duration_seconds: f64) {
    histogram!("job_duration_seconds", "queue" => queue.to_string()).record(duration_seconds);
}

/// Update the job queue size gauge
#[inline]
pub fn update_queue_size(queue: &str, size: u64) {
    gauge!("job_queue_size", "queue" => queue.to_string()).set(size as f64);
}

#[inline]
pub fn record_lock_contention(key: &str) {
    counter!("lock_contention_total", "key" => key.to_string()).increment(1);
}

#[inline]
pub fn record_cache_lookup(cache: &str, hit: bool) {
    if hit {
        counter!("cache_hits_total", "cache" => cache.to_string()).increment(1);
    } else {
        counter!("cache_misses_total", "cache" => cache.to_string()).increment(1);
    }
}

#[inline]
pub fn record_circuit_state(name: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("circuit_breaker_state", "name" => name.to_string()).set(value);
}

#[inline]
pub fn record_circuit_rejection(name: &str) {
    counter!("circuit_breaker_rejected_total", "name" => name.to_string()).increment(1);
}

/// Alert notification interface
///
/// Raised when a job exhausts its retries and is dead-lettered.
#[async_trait::async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(&self, job_id: &Uuid, queue: &str, attempts: u32) -> Result<()>;
}

/// Log-based alert notifier (default implementation)
///
/// Logs alerts at ERROR level so log-based alerting can pick them up.
pub struct LogAlertNotifier;

#[async_trait::async_trait]
impl AlertNotifier for LogAlertNotifier {
    #[tracing::instrument(skip(self))]
    async fn send_alert(&self, job_id: &Uuid, queue: &str, attempts: u32) -> Result<()> {
        tracing::error!(
            job_id = %job_id,
            queue = queue,
            attempts = attempts,
            alert_type = "job_exhausted",
            "ALERT: Job exhausted its retries after {} attempts and was dead-lettered",
            attempts
        );
        Ok(())
    }
}
