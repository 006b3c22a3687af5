//! Delay policy between reconnect attempts.
//!
//! The default is a fixed one-second interval retried forever. Growth
//! (`exponential_base > 1.0`) and jitter are opt-in; the delay is always
//! capped at `max_delay`. There is no attempt ceiling: a connection keeps
//! retrying until its owner closes it.

use rand::Rng;
use std::time::Duration;

/// Configuration for reconnect delays.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure (1.0 keeps the delay fixed).
    pub exponential_base: f64,
    /// Whether to randomize delays by a factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 1.0,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    /// Fixed-interval policy.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    /// Doubling backoff from `base_delay` up to `max_delay`, with jitter.
    pub fn backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: true,
        }
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `failures` (0-indexed consecutive failures).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let multiplier = self.exponential_base.max(1.0).powi(failures.min(64) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_one_second() {
        let config = ReconnectConfig::default();
        for failures in [0, 1, 5, 100] {
            assert_eq!(config.delay_for(failures), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ReconnectConfig::backoff(Duration::from_secs(1), Duration::from_secs(10))
            .with_jitter(false);

        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = ReconnectConfig::fixed(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(true);

        for _ in 0..20 {
            let delay = config.delay_for(0);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }
}
