//! Selector configuration types.
//!
//! Provides [`SelectorConfig`] for tuning score weights, the priority bias,
//! the static/historical blend and the fallback chain length. All fields
//! have defaults and are (de)serialisable via serde for TOML/JSON files.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

fn default_quality_weight() -> f64 {
    0.40
}

fn default_cost_weight() -> f64 {
    0.30
}

fn default_latency_weight() -> f64 {
    0.20
}

fn default_capability_weight() -> f64 {
    0.10
}

/// Weight added to quality for critical requests, or to cost for low ones.
fn default_priority_bias() -> f64 {
    0.15
}

/// Share of the blended score taken from the static score.
fn default_static_blend() -> f64 {
    0.7
}

/// Scaled latency at which latency efficiency reaches zero.
fn default_latency_reference_ms() -> u64 {
    10_000
}

fn default_max_fallbacks() -> usize {
    3
}

// ── SelectorConfig ─────────────────────────────────────────────────────

/// Configuration for [`super::Selector`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct SelectorConfig {
    /// Weight of backend quality in the static score. Default: `0.40`.
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,

    /// Weight of cost efficiency in the static score. Default: `0.30`.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,

    /// Weight of latency efficiency in the static score. Default: `0.20`.
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    /// Weight of the task capability rating in the static score. Default: `0.10`.
    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,

    /// Priority bias. Default: `0.15`.
    #[serde(default = "default_priority_bias")]
    pub priority_bias: f64,

    /// Static share of the blended score; the rest is historical.
    ///
    /// Range: `0.0..=1.0`. Default: `0.7`.
    #[serde(default = "default_static_blend")]
    pub static_blend: f64,

    /// Latency reference for efficiency scoring, in milliseconds.
    #[serde(default = "default_latency_reference_ms")]
    pub latency_reference_ms: u64,

    /// Maximum fallbacks after the primary. Default: `3`.
    #[serde(default = "default_max_fallbacks")]
    pub max_fallbacks: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            quality_weight: default_quality_weight(),
            cost_weight: default_cost_weight(),
            latency_weight: default_latency_weight(),
            capability_weight: default_capability_weight(),
            priority_bias: default_priority_bias(),
            static_blend: default_static_blend(),
            latency_reference_ms: default_latency_reference_ms(),
            max_fallbacks: default_max_fallbacks(),
        }
    }
}

/// Validate a [`SelectorConfig`], returning one human-readable error per
/// violated constraint.
pub fn validate(config: &SelectorConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let weights = [
        ("quality_weight", config.quality_weight),
        ("cost_weight", config.cost_weight),
        ("latency_weight", config.latency_weight),
        ("capability_weight", config.capability_weight),
        ("priority_bias", config.priority_bias),
    ];
    for (name, value) in weights {
        if !value.is_finite() || value < 0.0 {
            errors.push(format!("selector.{name} must be a finite value >= 0, got {value}"));
        }
    }

    let sum = config.quality_weight + config.cost_weight + config.latency_weight + config.capability_weight;
    if !(sum > 0.0) {
        errors.push("selector weights must not all be zero".to_string());
    }

    if !(0.0..=1.0).contains(&config.static_blend) {
        errors.push(format!(
            "selector.static_blend must be in [0.0, 1.0], got {}",
            config.static_blend
        ));
    }

    if config.latency_reference_ms == 0 {
        errors.push("selector.latency_reference_ms must be > 0".to_string());
    }

    errors
}

// ── Tests ──────────────────────────────────────────────────────────────
