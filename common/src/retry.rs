// Retry strategy implementation with exponential backoff and jitter

use crate::config::{QueueConfig, ResilienceConfig};
use rand::Rng;
use std::time::Duration;

/// Default number of retries when none is configured
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync + std::fmt::Debug {
    /// Calculate the delay before retry number `attempt` (0-based).
    /// Returns None if max retries exceeded
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of retries
    fn max_retries(&self) -> u32;
}

/// Exponential backoff retry strategy with jitter
///
/// Delay for attempt `n` is `base * multiplier^n`, capped at `max`, plus a
/// random jitter of up to `jitter_factor` of that delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(
        base_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            multiplier: multiplier.max(1.0),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_retries,
        }
    }

    /// Backoff between job redeliveries
    pub fn for_queue(config: &QueueConfig) -> Self {
        Self::with_config(
            config.backoff_base_ms,
            config.backoff_max_ms,
            config.backoff_multiplier,
            config.backoff_jitter,
            config.max_retries,
        )
    }

    /// Backoff between in-process call attempts. Attempts include the first
    /// call, so retries are one fewer.
    pub fn for_calls(config: &ResilienceConfig) -> Self {
        Self::with_config(
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
            2.0,
            config.retry_jitter,
            config.retry_max_attempts.saturating_sub(1),
        )
    }

    /// Calculate exponential delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.min(63) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if delay.is_finite() && delay < self.max_delay_ms as f64 {
            delay as u64
        } else {
            self.max_delay_ms
        }
    }

    /// Add random jitter to prevent thundering herd
    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }

        let base_delay_ms = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_ms)))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let strategy = ExponentialBackoff::with_config(100, 10_000, 2.0, 0.0, 10);

        assert_eq!(strategy.calculate_base_delay(0), 100);
        assert_eq!(strategy.calculate_base_delay(1), 200);
        assert_eq!(strategy.calculate_base_delay(2), 400);
        assert_eq!(strategy.calculate_base_delay(3), 800);
        assert_eq!(strategy.calculate_base_delay(6), 6_400);

        // 100 * 2^7 = 12800, capped at 10000
        assert_eq!(strategy.calculate_base_delay(7), 10_000);
        assert_eq!(strategy.calculate_base_delay(200), 10_000);
    }

    #[test]
    fn test_retry_limit_enforcement() {
        let strategy = ExponentialBackoff::with_config(5, 50, 2.0, 0.0, 4);

        for attempt in 0..4 {
            assert!(
                strategy.next_delay(attempt).is_some(),
                "Should allow retry at attempt {}",
                attempt
            );
        }
        assert!(strategy.next_delay(4).is_none());
        assert!(strategy.next_delay(5).is_none());
        assert_eq!(strategy.max_retries(), 4);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let strategy = ExponentialBackoff::with_config(5_000, 60_000, 2.0, 0.1, 3);

        for _ in 0..20 {
            let delay = strategy.next_delay(0).unwrap().as_millis();
            assert!(
                (5_000..=5_500).contains(&delay),
                "Delay {}ms should be between 5000ms and 5500ms",
                delay
            );
        }
    }

    #[test]
    fn test_jitter_factor_clamping() {
        let strategy1 = ExponentialBackoff::with_config(5, 1800, 2.0, -0.5, 3);
        assert_eq!(strategy1.jitter_factor, 0.0);

        let strategy2 = ExponentialBackoff::with_config(5, 1800, 2.0, 1.5, 3);
        assert_eq!(strategy2.jitter_factor, 1.0);
    }

    #[test]
    fn test_calls_strategy_counts_first_attempt() {
        let config = ResilienceConfig {
            retry_max_attempts: 3,
            ..ResilienceConfig::default()
        };
        assert_eq!(ExponentialBackoff::for_calls(&config).max_retries(), 2);
    }

    #[test]
    fn test_fixed_delay_strategy() {
        let delay = Duration::from_millis(10);
        let strategy = FixedDelay::new(delay, 3);

        for attempt in 0..3 {
            assert_eq!(strategy.next_delay(attempt), Some(delay));
        }
        assert_eq!(strategy.next_delay(3), None);
    }
}
