//! Delay between recovery attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::RecoveryConfig;

/// Fixed or exponential delay with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub exponential: bool,
}

impl From<&RecoveryConfig> for Backoff {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.delay_secs),
            max: Duration::from_secs(config.max_delay_secs),
            exponential: config.exponential,
        }
    }
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            max: base,
            exponential: false,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        if !self.exponential {
            return self.base;
        }

        let base_ms = self.base.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
        let capped = delay_ms.min(self.max.as_millis() as u64);

        // Jitter of up to 10%
        let jitter_range = capped / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let backoff = Backoff::fixed(Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            exponential: true,
        };
        assert!(backoff.delay(1).as_millis() >= 100);
        assert!(backoff.delay(2).as_millis() >= 200);

        let capped = backoff.delay(10).as_millis();
        assert!((1000..1100).contains(&capped));
    }
}
