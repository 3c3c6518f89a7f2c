// Retry strategy implementation with exponential backoff and jitter
//
// Strategies only compute delays; callers own the loop.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Default number of attempts, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay to wait after failed attempt number `attempt` (0-based).
    /// Returns None once the attempt budget is used up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total attempts allowed, including the first one
    fn max_attempts(&self) -> u32;

    /// Check if another attempt is allowed after `attempt` failed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts()
    }
}

/// Exponential backoff retry strategy with jitter
/// Delay: base * 3^attempt, capped at max, plus up to `jitter_factor` extra
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
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
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let jitter = if config.jitter { 0.1 } else { 0.0 };
        Self::with_config(
            config.base_delay_ms,
            config.max_delay_ms,
            jitter,
            config.max_attempts,
        )
    }

    /// Calculate exponential delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 3_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Longest total time spent sleeping between attempts, jitter included
    pub fn max_total_delay(&self) -> Duration {
        let total_ms = (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| {
                let base = self.calculate_base_delay(attempt);
                base.saturating_add((base as f64 * self.jitter_factor) as u64)
            })
            .fold(0u64, u64::saturating_add);
        Duration::from_millis(total_ms)
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

        base_delay_ms.saturating_add(jitter_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }

        let base_delay_ms = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_ms)))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let strategy = ExponentialBackoff::with_config(1000, 60_000, 0.0, 10);

        assert_eq!(strategy.calculate_base_delay(0), 1000);
        assert_eq!(strategy.calculate_base_delay(1), 3000);
        assert_eq!(strategy.calculate_base_delay(2), 9000);
        assert_eq!(strategy.calculate_base_delay(3), 27_000);
        // 81s capped at 60s
        assert_eq!(strategy.calculate_base_delay(4), 60_000);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let strategy = ExponentialBackoff::with_config(1000, 60_000, 0.0, u32::MAX);
        assert_eq!(strategy.calculate_base_delay(200), 60_000);
    }

    #[test]
    fn test_attempt_budget_enforcement() {
        let strategy = ExponentialBackoff::with_config(10, 100, 0.0, 3);

        // Two retries after the first attempt, then give up
        assert!(strategy.next_delay(0).is_some());
        assert!(strategy.next_delay(1).is_some());
        assert!(strategy.next_delay(2).is_none());
        assert!(strategy.next_delay(3).is_none());
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let strategy = ExponentialBackoff::with_config(10, 100, 0.0, 1);
        assert!(!strategy.should_retry(0));
        assert!(strategy.next_delay(0).is_none());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let strategy = ExponentialBackoff::with_config(5000, 60_000, 0.1, 5);

        let delays: Vec<u128> = (0..20)
            .filter_map(|_| strategy.next_delay(0))
            .map(|d| d.as_millis())
            .collect();

        assert_eq!(delays.len(), 20);
        for delay in delays {
            assert!(
                (5000..=5500).contains(&delay),
                "Delay {}ms should be between 5000ms and 5500ms",
                delay
            );
        }
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            base_delay_ms: 200,
            max_delay_ms: 1000,
            max_attempts: 4,
            jitter: false,
        };
        let strategy = ExponentialBackoff::from_config(&config);
        assert_eq!(strategy.max_attempts(), 4);
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(600)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(1000)));
        assert_eq!(strategy.next_delay(3), None);
    }

    #[test]
    fn test_max_total_delay_covers_every_retry() {
        // 1s + 3s + 9s between four attempts, plus 10% jitter
        let strategy = ExponentialBackoff::with_config(1000, 60_000, 0.1, 4);
        assert_eq!(strategy.max_total_delay(), Duration::from_millis(14_300));

        let single = ExponentialBackoff::with_config(1000, 60_000, 0.1, 1);
        assert_eq!(single.max_total_delay(), Duration::ZERO);
    }

    #[test]
    fn test_fixed_delay_strategy() {
        let delay = Duration::from_millis(10);
        let strategy = FixedDelay::new(delay, 3);

        assert_eq!(strategy.next_delay(0), Some(delay));
        assert_eq!(strategy.next_delay(1), Some(delay));
        assert_eq!(strategy.next_delay(2), None);
    }

    #[test]
    fn test_jitter_factor_clamping() {
        let strategy1 = ExponentialBackoff::with_config(5, 1800, -0.5, 3);
        assert_eq!(strategy1.jitter_factor, 0.0);

        let strategy2 = ExponentialBackoff::with_config(5, 1800, 1.5, 3);
        assert_eq!(strategy2.jitter_factor, 1.0);
    }
}
