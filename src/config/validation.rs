//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants, duplicate backend names).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::RouterConfig;
use crate::{resilience, routing};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "cache.min_quality").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns every violation found.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors: Vec<ConfigError> = Vec::new();

    // ── Selector and resilience sections validate themselves ────────
    errors.extend(routing::config::validate(&config.selector).into_iter().map(ConfigError::Validation));
    errors.extend(resilience::validate(&config.resilience).into_iter().map(ConfigError::Validation));

    // ── Cache ────────────────────────────────────────────────────────
    if !(0.0..=1.0).contains(&config.cache.min_quality) {
        errors.push(ConfigError::InvalidField {
            field: "cache.min_quality".into(),
            value: config.cache.min_quality.to_string(),
            reason: "must be between 0.0 and 1.0".into(),
        });
    }
    if config.cache.enabled && config.cache.max_entries == 0 {
        errors.push(ConfigError::InvalidField {
            field: "cache.max_entries".into(),
            value: "0".into(),
            reason: "must be at least 1 when the cache is enabled".into(),
        });
    }
    if config.cache.enabled && config.cache.ttl_secs == 0 {
        errors.push(ConfigError::InvalidField {
            field: "cache.ttl_secs".into(),
            value: "0".into(),
            reason: "must be at least 1 second when the cache is enabled".into(),
        });
    }

    // ── Learning ─────────────────────────────────────────────────────
    let rate = config.learning.learning_rate;
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        errors.push(ConfigError::InvalidField {
            field: "learning.learning_rate".into(),
            value: rate.to_string(),
            reason: "must be between 0.0 and 1.0".into(),
        });
    }
    if config.learning.history_capacity == 0 {
        errors.push(ConfigError::InvalidField {
            field: "learning.history_capacity".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    if config.learning.stats_window == 0 {
        errors.push(ConfigError::InvalidField {
            field: "learning.stats_window".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    if config.learning.feed_capacity == 0 {
        errors.push(ConfigError::InvalidField {
            field: "learning.feed_capacity".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Orchestrator ─────────────────────────────────────────────────
    if config.orchestrator.batch_concurrency == 0 {
        errors.push(ConfigError::InvalidField {
            field: "orchestrator.batch_concurrency".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Backends ─────────────────────────────────────────────────────
    let mut seen = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        if let Err(e) = backend.validate() {
            errors.push(ConfigError::InvalidField {
                field: format!("backends[{i}]"),
                value: backend.name.clone(),
                reason: e.to_string(),
            });
        }
        if !seen.insert(backend.name.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: format!("backends[{i}].name"),
                value: backend.name.clone(),
                reason: "duplicate backend name".into(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
