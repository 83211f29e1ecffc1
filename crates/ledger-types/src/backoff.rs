use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for exponential retry delays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 60 * 60 * 1000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Millisecond delays with no jitter, for tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Stateful exponential backoff.
///
/// Each call to [`next_delay`](Self::next_delay) returns a longer delay until
/// [`reset`](Self::reset) is called after a success.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Compute the next delay and advance.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(63) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64).max(0.0) as u64;
        if !self.config.jitter || capped < 2 {
            return Duration::from_millis(capped);
        }
        let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
        Duration::from_millis(jittered)
    }

    /// Restart from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            jitter: true,
            ..no_jitter()
        });
        for expected in [100u64, 200, 400] {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(delay >= expected / 2 && delay <= expected, "{delay} vs {expected}");
        }
    }

    #[test]
    fn immediate_never_waits() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::immediate());
        for _ in 0..10 {
            assert_eq!(backoff.next_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn config_from_toml_fills_defaults() {
        let config: BackoffConfig = toml::from_str("initial_delay_ms = 5").unwrap();
        assert_eq!(config.initial_delay_ms, 5);
        assert_eq!(config.multiplier, 2.0);
    }
}
