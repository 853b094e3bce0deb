//! # Stage: Resilient Execution
//!
//! ## Responsibility
//! Execute a plan's fallback chain against real backends: per-backend
//! circuit breakers, cached health probes, per-call timeouts bounded by the
//! request deadline, and exponential-backoff retries on the same backend.
//!
//! ## Guarantees
//! - An open circuit is skipped, never called.
//! - Attempts within a request are strictly sequential and never repeat a
//!   backend.
//! - Every individual call updates that backend's breaker; exactly one
//!   outcome is recorded per attempted backend.
//! - No call outlives the request's latency budget.
//!
//! ## NOT Responsible For
//! - Choosing the chain (that belongs to `routing`)
//! - Caching responses (that belongs to `cache`)

pub mod circuit_breaker;
pub mod deadline;
pub mod executor;
pub mod health;
pub mod retry;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakers, CircuitSnapshot, CircuitStatus};
pub use deadline::Deadline;
pub use executor::{AttemptFailure, ResilientRouter, SkipReason, SkippedBackend};
pub use health::{HealthCache, HealthConfig};
pub use retry::{RetryConfig, RetryPolicy};

fn default_call_timeout_ms() -> u64 {
    30_000
}

/// Resilience configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResilienceConfig {
    /// Upper bound on a single backend call, in milliseconds. The effective
    /// timeout is also capped by the request's remaining budget.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Health-check settings.
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Validate a [`ResilienceConfig`], returning one error per violation.
pub fn validate(config: &ResilienceConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if config.call_timeout_ms == 0 {
        errors.push("resilience.call_timeout_ms must be > 0".to_string());
    }
    if config.breaker.failure_threshold == 0 {
        errors.push("resilience.breaker.failure_threshold must be > 0".to_string());
    }
    if config.breaker.failure_window_ms == 0 {
        errors.push("resilience.breaker.failure_window_ms must be > 0".to_string());
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        errors.push(format!(
            "resilience.retry.max_delay_ms ({}) must be >= base_delay_ms ({})",
            config.retry.max_delay_ms, config.retry.base_delay_ms
        ));
    }
    if !config.retry.multiplier.is_finite() || config.retry.multiplier < 1.0 {
        errors.push(format!(
            "resilience.retry.multiplier must be >= 1.0, got {}",
            config.retry.multiplier
        ));
    }
    if config.health.enabled && config.health.probe_timeout_ms == 0 {
        errors.push("resilience.health.probe_timeout_ms must be > 0".to_string());
    }
    errors
}
