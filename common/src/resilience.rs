// Resilience policy: an ordered pipeline of retry, circuit breaker and time limit layers

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::config::ResilienceConfig;
use crate::retry::{ExponentialBackoff, RetryStrategy};
use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Errors surfaced by a resilience policy
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    /// Rejected without invoking the operation
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Time limit elapsed, the in-flight call was abandoned
    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Operation failed: {0}")]
    Failed(E),
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Underlying operation error, if the operation ran and failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Retry layer settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    max_attempts: u32,
    strategy: Arc<dyn RetryStrategy>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: impl RetryStrategy + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: Arc::new(strategy),
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.retry_max_attempts, ExponentialBackoff::for_calls(config))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), or None to give up
    fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        self.strategy.next_delay(attempt - 1)
    }
}

/// One decorator in the pipeline
#[derive(Debug, Clone)]
pub enum PolicyLayer {
    Retry(RetryPolicy),
    CircuitBreaker(CircuitBreaker),
    TimeLimit(Duration),
}

/// Ordered pipeline of layers; the first layer is outermost
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    name: String,
    layers: Vec<PolicyLayer>,
}

impl ResiliencePolicy {
    pub fn builder(name: impl Into<String>) -> ResiliencePolicyBuilder {
        ResiliencePolicyBuilder {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    /// Retry → CircuitBreaker → TimeLimit, with the breaker shared per `name`
    pub fn from_config(
        name: impl Into<String>,
        config: &ResilienceConfig,
        registry: &CircuitBreakerRegistry,
    ) -> Self {
        let name = name.into();
        let breaker = registry.get_or_create(&name);
        Self::builder(name)
            .retry(RetryPolicy::from_config(config))
            .circuit_breaker(breaker)
            .time_limit(Duration::from_millis(config.time_limit_ms))
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[PolicyLayer] {
        &self.layers
    }

    /// Run `operation` through every layer. The operation is called once per
    /// attempt.
    #[instrument(skip_all, fields(policy = %self.name))]
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
    {
        run_layers(&self.layers, &operation).await
    }
}

pub struct ResiliencePolicyBuilder {
    name: String,
    layers: Vec<PolicyLayer>,
}

impl ResiliencePolicyBuilder {
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.layers.push(PolicyLayer::Retry(policy));
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.layers.push(PolicyLayer::CircuitBreaker(breaker));
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.layers.push(PolicyLayer::TimeLimit(limit));
        self
    }

    pub fn build(self) -> ResiliencePolicy {
        ResiliencePolicy {
            name: self.name,
            layers: self.layers,
        }
    }
}

fn run_layers<'a, T, E, F, Fut>(
    layers: &'a [PolicyLayer],
    operation: &'a F,
) -> BoxFuture<'a, Result<T, ResilienceError<E>>>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'a,
    T: Send + 'a,
    E: Display + Send + 'a,
{
    let Some((layer, rest)) = layers.split_first() else {
        return Box::pin(async move { operation().await.map_err(ResilienceError::Failed) });
    };

    match layer {
        PolicyLayer::Retry(retry) => Box::pin(async move {
            let mut attempt = 1;
            loop {
                match run_layers(rest, operation).await {
                    Ok(value) => return Ok(value),
                    Err(err @ ResilienceError::CircuitOpen { .. }) => return Err(err),
                    Err(err) => match retry.delay_after(attempt) {
                        Some(delay) => {
                            warn!(
                                attempt = attempt,
                                max_attempts = retry.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Attempt failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(err),
                    },
                }
            }
        }),
        PolicyLayer::CircuitBreaker(breaker) => Box::pin(async move {
            let Some(permit) = breaker.try_acquire() else {
                debug!(circuit_breaker = %breaker.name(), "Call rejected, circuit open");
                return Err(ResilienceError::CircuitOpen {
                    name: breaker.name().to_string(),
                });
            };
            let result = run_layers(rest, operation).await;
            match &result {
                Ok(_) => permit.success(),
                Err(_) => permit.failure(),
            }
            result
        }),
        PolicyLayer::TimeLimit(limit) => {
            let limit = *limit;
            Box::pin(async move {
                match tokio::time::timeout(limit, run_layers(rest, operation)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(limit_ms = limit.as_millis() as u64, "Call abandoned at time limit");
                        Err(ResilienceError::TimedOut(limit))
                    }
                }
            })
        }
    }
}
