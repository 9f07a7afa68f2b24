//! Exponential backoff shared by broker publishing and coordination
//! re-registration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Ceiling for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// A policy with no jitter, for deterministic tests.
    pub fn fixed(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = (base.as_millis() as f64 * self.jitter) as u64;
        if spread == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(Duration::from_millis(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_ceiling() {
        let backoff = BackoffConfig::fixed(100, 1000);
        assert_eq!(backoff.base_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(800));
        assert_eq!(backoff.base_delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.base_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let backoff = BackoffConfig::fixed(50, 1000);
        assert_eq!(backoff.base_delay(0), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_never_exceeds_ceiling() {
        let backoff = BackoffConfig {
            initial_delay_ms: 500,
            max_delay_ms: 1000,
            jitter: 0.5,
        };
        for attempt in 1..10 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(1000));
            assert!(backoff.delay(attempt) >= backoff.base_delay(attempt));
        }
    }
}
