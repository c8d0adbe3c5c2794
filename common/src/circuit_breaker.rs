// Circuit breaker with a sliding outcome window
//
// CLOSED -> OPEN once failures in the last `window_size` calls reach
// `failure_threshold`; OPEN -> HALF_OPEN after `cooldown`; HALF_OPEN admits
// `half_open_max_calls` trial calls, closing on success and reopening on failure.

use crate::clock::{to_chrono, Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls considered
    pub window_size: usize,
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub cooldown: Duration,
    /// Trial calls admitted while HalfOpen
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl From<&ResilienceConfig> for CircuitBreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            window_size: config.circuit_window_size.max(1),
            failure_threshold: config.circuit_failure_threshold.max(1),
            cooldown: Duration::from_secs(config.circuit_cooldown_seconds),
            half_open_max_calls: config.circuit_half_open_max_calls.max(1),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    /// `true` marks a failed call
    window: VecDeque<bool>,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    /// Bumped on every transition that starts a new admission round
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn failures(&self) -> u32 {
        self.window.iter().filter(|failed| **failed).count() as u32
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning shares the state, so every clone guards the same operation.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

/// Admission to make one call; report the outcome through it
///
/// Dropping a permit without reporting (for example when a time limit
/// abandons the call) counts as a failure. Outcomes of permits issued
/// before the last state transition are ignored.
#[derive(Debug)]
pub struct CallPermit {
    breaker: CircuitBreaker,
    generation: u64,
    reported: bool,
}

impl CallPermit {
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.reported {
            debug!(circuit_breaker = %self.breaker.name, "Call abandoned, counting as failure");
            self.breaker.on_failure(self.generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the current state of the circuit breaker
    pub fn get_state(&self) -> CircuitState {
        self.lock_state().state
    }

    /// Failures in the current window
    pub fn get_failure_count(&self) -> u32 {
        self.lock_state().failures()
    }

    /// Ask to make a call. `None` while open, or while half-open and the
    /// trial calls are already in flight.
    pub fn try_acquire(&self) -> Option<CallPermit> {
        let mut state = self.lock_state();

        let allowed = match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map(|at| self.clock.now() - at >= to_chrono(self.config.cooldown))
                    .unwrap_or(true);
                if cooled_down {
                    info!(
                        circuit_breaker = %self.name,
                        "Circuit breaker transitioning from Open to HalfOpen"
                    );
                    state.state = CircuitState::HalfOpen;
                    state.half_open_in_flight = 1;
                    telemetry::record_circuit_state(&self.name, CircuitState::HalfOpen);
                }
                cooled_down
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight < self.config.half_open_max_calls {
                    state.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            telemetry::record_circuit_rejection(&self.name);
            return None;
        }

        Some(CallPermit {
            breaker: self.clone(),
            generation: state.generation,
            reported: false,
        })
    }

    /// Execute a function with circuit breaker protection
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(CircuitBreakerError::CircuitOpen {
                name: self.name.clone(),
            });
        };

        match f.await {
            Ok(result) => {
                permit.success();
                Ok(result)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitBreakerError::RequestFailed(err))
            }
        }
    }

    fn push_outcome(&self, state: &mut CircuitBreakerState, failed: bool) {
        state.window.push_back(failed);
        while state.window.len() > self.config.window_size {
            state.window.pop_front();
        }
    }

    fn open(&self, state: &mut CircuitBreakerState) {
        state.state = CircuitState::Open;
        state.opened_at = Some(self.clock.now());
        state.half_open_in_flight = 0;
        state.window.clear();
        state.generation += 1;
        telemetry::record_circuit_state(&self.name, CircuitState::Open);
    }

    /// Handle successful request
    fn on_success(&self, generation: u64) {
        let mut state = self.lock_state();
        if generation != state.generation {
            debug!(circuit_breaker = %self.name, "Ignoring success of a call admitted before the last transition");
            return;
        }

        match state.state {
            CircuitState::Closed => self.push_outcome(&mut state, false),
            CircuitState::HalfOpen => {
                info!(
                    circuit_breaker = %self.name,
                    "Circuit breaker transitioning from HalfOpen to Closed"
                );
                state.state = CircuitState::Closed;
                state.window.clear();
                state.opened_at = None;
                state.half_open_in_flight = 0;
                state.generation += 1;
                telemetry::record_circuit_state(&self.name, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Handle failed request
    fn on_failure(&self, generation: u64) {
        let mut state = self.lock_state();
        if generation != state.generation {
            debug!(circuit_breaker = %self.name, "Ignoring failure of a call admitted before the last transition");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                self.push_outcome(&mut state, true);
                let failures = state.failures();
                if failures >= self.config.failure_threshold {
                    warn!(
                        circuit_breaker = %self.name,
                        failure_count = failures,
                        threshold = self.config.failure_threshold,
                        window_size = self.config.window_size,
                        "Circuit breaker transitioning from Closed to Open"
                    );
                    self.open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    circuit_breaker = %self.name,
                    "Circuit breaker transitioning from HalfOpen to Open due to failure"
                );
                self.open(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    /// Manually reset the circuit breaker to Closed state
    pub fn reset(&self) {
        let mut state = self.lock_state();
        info!(circuit_breaker = %self.name, "Circuit breaker manually reset to Closed");
        let generation = state.generation + 1;
        *state = CircuitBreakerState::new();
        state.generation = generation;
        telemetry::record_circuit_state(&self.name, CircuitState::Closed);
    }
}

/// Circuit breaker errors
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Request failed: {0}")]
    RequestFailed(E),
}

/// Circuit breakers shared per logical operation name
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Get or create the circuit breaker for an operation
    pub fn get_or_create(&self, operation: &str) -> CircuitBreaker {
        {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = breakers.get(operation) {
                return cb.clone();
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());

        // Double-check after acquiring write lock
        if let Some(cb) = breakers.get(operation) {
            return cb.clone();
        }

        let cb = CircuitBreaker::with_clock(operation, self.config.clone(), Arc::clone(&self.clock));
        breakers.insert(operation.to_string(), cb.clone());
        cb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let cb = CircuitBreaker::with_clock(
            "test",
            CircuitBreakerConfig::default(),
            Arc::new(clock.clone()),
        );
        (cb, clock)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<String>> {
        cb.call(async { Err::<(), String>("error".to_string()) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<String>> {
        cb.call(async { Ok::<(), String>(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_five_consecutive_failures() {
        let (cb, _) = breaker();

        for i in 0..5 {
            assert!(fail(&cb).await.is_err());
            if i < 4 {
                assert_eq!(cb.get_state(), CircuitState::Closed);
            }
        }
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_opens_on_five_failures_within_ten_call_window() {
        let (cb, _) = breaker();

        // Interleaved: S F S F S F S F -> 4 failures in window
        for _ in 0..4 {
            succeed(&cb).await.unwrap();
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.get_failure_count(), 4);

        let _ = fail(&cb).await;
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failures_slide_out_of_window() {
        let (cb, _) = breaker();

        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        for _ in 0..10 {
            succeed(&cb).await.unwrap();
        }
        assert_eq!(cb.get_failure_count(), 0);

        let _ = fail(&cb).await;
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejects_when_open_without_invoking() {
        let (cb, _) = breaker();
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }

        let mut invoked = false;
        let result: Result<(), CircuitBreakerError<String>> = cb
            .call(async {
                invoked = true;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_cooldown_admits_exactly_one_trial() {
        let (cb, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }

        clock.advance(Duration::from_secs(29));
        assert!(cb.try_acquire().is_none());

        clock.advance(Duration::from_secs(1));
        let trial = cb.try_acquire().expect("trial call after cooldown");
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);

        // Second caller while the trial is in flight is rejected
        assert!(cb.try_acquire().is_none());

        trial.success();
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_reopens_on_trial_failure() {
        let (cb, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        clock.advance(Duration::from_secs(30));

        let _ = fail(&cb).await;
        assert_eq!(cb.get_state(), CircuitState::Open);

        // Cooldown restarts from the trial failure
        clock.advance(Duration::from_secs(10));
        assert!(cb.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_stale_success_does_not_decide_trial() {
        let (cb, clock) = breaker();
        let stale = cb.try_acquire().expect("admitted while closed");
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        clock.advance(Duration::from_secs(30));

        let trial = cb.try_acquire().expect("trial call after cooldown");
        stale.success();
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_none());

        trial.success();
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_failure_does_not_reopen_during_trial() {
        let (cb, clock) = breaker();
        let stale = cb.try_acquire().expect("admitted while closed");
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        clock.advance(Duration::from_secs(30));

        let trial = cb.try_acquire().expect("trial call after cooldown");
        stale.failure();
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);

        trial.success();
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_failure_after_close_is_not_counted() {
        let (cb, clock) = breaker();
        let stale = cb.try_acquire().expect("admitted while closed");
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        clock.advance(Duration::from_secs(30));
        cb.try_acquire().expect("trial").success();

        drop(stale);
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.get_failure_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_trial_counts_as_failure() {
        let (cb, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        clock.advance(Duration::from_secs(30));

        let trial = cb.try_acquire().expect("trial call after cooldown");
        drop(trial);
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_circuit_breaker_reset() {
        let (cb, _) = breaker();
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.get_state(), CircuitState::Open);

        cb.reset();

        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.get_failure_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_shares_breaker_per_operation() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get_or_create("external:weather");
        let b = registry.get_or_create("external:weather");
        let other = registry.get_or_create("external:geo");

        for _ in 0..5 {
            let _ = fail(&a).await;
        }
        assert_eq!(b.get_state(), CircuitState::Open);
        assert_eq!(other.get_state(), CircuitState::Closed);
    }
}
