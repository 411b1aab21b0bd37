//! Reconnect backoff policy.

use rand::Rng;
use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential backoff with a ceiling and subtractive jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, multiplier: f64, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.initial_backoff(),
            config.backoff_multiplier,
            config.max_backoff(),
            config.jitter,
            config.max_reconnect_attempts,
        )
    }

    /// Delay before attempt `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Delay before attempt `attempt` with jitter drawn from `sample` in [0, 1).
    #[must_use]
    pub fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let factor = 1.0 - self.jitter * sample.clamp(0.0, 1.0);
        self.base_delay(attempt).mul_f64(factor)
    }

    /// Delay before attempt `attempt` with random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        self.delay_with(attempt, sample)
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    #[must_use]
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backoff {
        Backoff::new(Duration::from_millis(500), 2.0, Duration::from_secs(30), 0.2, 10)
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let backoff = policy();
        assert_eq!(backoff.base_delay(1), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(4));
        assert_eq!(backoff.base_delay(7), Duration::from_secs(30));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_only_shortens() {
        let backoff = policy();
        assert_eq!(backoff.delay_with(3, 0.0), Duration::from_secs(2));
        assert_eq!(backoff.delay_with(3, 0.5), Duration::from_millis(1800));

        for _ in 0..100 {
            let delay = backoff.delay(3);
            assert!(delay <= Duration::from_secs(2));
            assert!(delay >= Duration::from_millis(1600));
        }
    }

    #[test]
    fn test_exhaustion() {
        let backoff = policy();
        assert!(!backoff.is_exhausted(9));
        assert!(backoff.is_exhausted(10));
    }

    #[test]
    fn test_from_config() {
        let backoff = Backoff::from_config(&ConnectionConfig::default());
        assert_eq!(backoff, policy());
    }
}
