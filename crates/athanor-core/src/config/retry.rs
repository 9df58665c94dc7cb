use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },

    /// Exponential: initial * 2^attempt (capped at max)
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial_ms: 50,
            max_ms: 5_000,
        }
    }
}

impl BackoffStrategy {
    /// Calculate delay for a given retry attempt (0-based)
    pub fn calculate(&self, attempt: usize) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Exponential { initial_ms, max_ms } => {
                let multiplier = 2u64.saturating_pow(attempt.min(32) as u32);
                let delay = initial_ms.saturating_mul(multiplier);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::Fixed { delay_ms: 100 };
        assert_eq!(backoff.calculate(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate(9), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffStrategy::Exponential {
            initial_ms: 10,
            max_ms: 1000,
        };
        assert_eq!(backoff.calculate(0), Duration::from_millis(10));
        assert_eq!(backoff.calculate(1), Duration::from_millis(20));
        assert_eq!(backoff.calculate(3), Duration::from_millis(80));
        assert_eq!(backoff.calculate(20), Duration::from_millis(1000));
        assert_eq!(backoff.calculate(usize::MAX), Duration::from_millis(1000));
    }
}
