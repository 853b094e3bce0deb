//! # Stage: Declarative Router Configuration
//!
//! ## Responsibility
//! Parse and validate TOML router configuration: selector weights,
//! resilience tuning, cache bounds, learning parameters, front-door
//! settings and the initial backend catalog.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Complete defaults: an empty file is a valid configuration
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the router from config (that belongs to `orchestrator`)
//! - Provider credentials (adapters read them from the environment)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::catalog::BackendDescriptor;
use crate::learning::LearningConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::resilience::ResilienceConfig;
use crate::routing::SelectorConfig;

/// Root configuration for a router instance.
///
/// Every section is optional and falls back to documented defaults.
///
/// # Example
///
/// ```toml
/// [selector]
/// max_fallbacks = 2
///
/// [resilience.breaker]
/// failure_threshold = 3
///
/// [[backends]]
/// name = "small"
/// provider = "echo"
/// input_cost_per_token = 0.000001
/// output_cost_per_token = 0.000002
/// max_context_tokens = 32000
/// nominal_latency_ms = 400
/// quality = 0.75
/// capabilities = [{ task = "general", score = 0.7 }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Scoring weights and fallback depth.
    #[serde(default)]
    pub selector: SelectorConfig,
    /// Timeouts, retries, circuit breaking and health checks.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Response cache bounds.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Outcome history and quality learning.
    #[serde(default)]
    pub learning: LearningConfig,
    /// Coalescing and batching.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Backends registered at startup, in tie-break order.
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

/// Export the JSON Schema for [`RouterConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn json_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}
