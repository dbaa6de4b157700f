//! Reconnection backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "millis")]
    pub initial_backoff: Duration,

    /// Upper bound for the un-jittered delay
    #[serde(with = "millis")]
    pub max_backoff: Duration,

    /// Growth factor per consecutive failure
    pub multiplier: f64,

    /// Add up to 25% random jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt number (0-based)
    #[must_use]
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let duration = if self.jitter {
            let jitter_factor = f64::from(rand::thread_rng().gen_range(0u32..=25)) / 100.0;
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(duration as u64)
    }

    /// Check parameters are usable
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err("retry.initial_backoff must be non-zero".to_string());
        }
        if self.max_backoff < self.initial_backoff {
            return Err("retry.max_backoff must be >= retry.initial_backoff".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("retry.multiplier must be a finite number >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Per-supervisor backoff state
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Fresh state
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.backoff_duration(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Consecutive failures since the last reset
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget past failures (after a successful Connected transition)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// How dial attempts pick a proxy from the configured list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxySelection {
    /// Every dial attempt takes the next proxy from a shared cursor
    #[default]
    RoundRobin,
    /// Node *i* of the snapshot always uses proxy *i mod n*
    Sticky,
}

/// Duration as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_backoff_calculation() {
        let config = no_jitter();

        assert_eq!(config.backoff_duration(0).as_millis(), 100);
        assert_eq!(config.backoff_duration(1).as_millis(), 200);
        assert_eq!(config.backoff_duration(2).as_millis(), 400);

        // Capped at max
        assert_eq!(config.backoff_duration(10).as_millis(), 10_000);
        assert_eq!(config.backoff_duration(u32::MAX).as_millis(), 10_000);
    }

    #[test]
    fn test_retry_backoff_with_jitter() {
        let config = RetryConfig {
            jitter: true,
            ..no_jitter()
        };

        for _ in 0..200 {
            let backoff = config.backoff_duration(0).as_millis();
            assert!((100..=125).contains(&backoff), "{backoff}");
            let capped = config.backoff_duration(20).as_millis();
            assert!((10_000..=12_500).contains(&capped), "{capped}");
        }
    }

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert!(config.validate().is_ok());
        assert_eq!(ProxySelection::default(), ProxySelection::RoundRobin);
    }

    #[test]
    fn test_validate() {
        assert!(
            RetryConfig {
                initial_backoff: Duration::ZERO,
                ..no_jitter()
            }
            .validate()
            .is_err()
        );
        assert!(
            RetryConfig {
                multiplier: 0.5,
                ..no_jitter()
            }
            .validate()
            .is_err()
        );
        assert!(
            RetryConfig {
                max_backoff: Duration::from_millis(10),
                ..no_jitter()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_backoff_state_resets() {
        let mut backoff = Backoff::new(no_jitter());
        assert_eq!(backoff.next_delay().as_millis(), 100);
        assert_eq!(backoff.next_delay().as_millis(), 200);
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 100);
    }

    #[test]
    fn test_proxy_selection_serde_names() {
        let sticky: ProxySelection = serde_json::from_str("\"sticky\"").unwrap();
        assert_eq!(sticky, ProxySelection::Sticky);
        let rr: ProxySelection = serde_json::from_str("\"round-robin\"").unwrap();
        assert_eq!(rr, ProxySelection::RoundRobin);
    }
}
