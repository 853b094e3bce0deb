//! Retry backoff for a single backend.
//!
//! The executor drives the loop itself (it must consult the breaker and the
//! request deadline between calls), so this module only answers "how long
//! before retry N".

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    false
}

/// Retry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    /// Retries after the first call on the same backend. Default: `2`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds. Default: `100`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds. Default: `2000`.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per retry. Default: `2.0`.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay. Default: `false`.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Exponential backoff policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first call.
    pub max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Exponential backoff without jitter, capped at 60 s.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based), jittered if enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.calculate_delay(retry);
        if self.jitter {
            with_jitter(delay)
        } else {
            delay
        }
    }

    fn calculate_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        if !millis.is_finite() {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Add up to 25% random jitter to `duration`.
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = (duration.as_millis() / 4) as u64;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_huge_retry_number_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn test_jitter() {
        let base = Duration::from_secs(1);
        let jittered = with_jitter(base);
        assert!(jittered >= base);
        assert!(jittered <= base + Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_on_tiny_delay_is_identity() {
        assert_eq!(with_jitter(Duration::from_millis(2)), Duration::from_millis(2));
    }

    #[test]
    fn test_jittered_policy_stays_in_range() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            jitter: true,
            ..RetryConfig::default()
        });
        let d = policy.delay_for(1);
        assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125));
    }

    #[test]
    fn test_none_never_retries() {
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }
}
