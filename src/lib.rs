//! # tokio-backend-router
//!
//! A cost-aware, resilient request router for heterogeneous generation
//! backends over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! RouteRequest → Cache ─hit──────────────────────────────────────────→ RoutedResponse
//!                  │miss
//!                  ▼
//!             In-flight coalescing → Selector (plan) → ResilientRouter (execute)
//!                                                          │
//!                                   breaker / health / retry / fallback chain
//!                                                          │
//!                                         OutcomeRecord → LearningStore → Catalog quality
//! ```
//!
//! The [`RequestOrchestrator`] is the front door; every other component is an
//! injectable store object so tests can build isolated instances.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod learning;
pub mod metrics;
pub mod orchestrator;
pub mod request;
pub mod resilience;
pub mod routing;

// Re-exports for convenience
pub use backend::{
    Backend, BackendError, BackendRequest, BackendResponse, EchoBackend,
    OpenAiCompatibleBackend, ProviderRegistry, TokenUsage,
};
pub use cache::{fingerprint, CacheEntry, ResponseCache};
pub use catalog::{BackendCatalog, BackendDescriptor, BackendStatus, CapabilityScore};
pub use learning::{LearningStore, OutcomeRecord, PerformanceStats};
pub use orchestrator::{BackendView, OrchestratorConfig, RequestOrchestrator};
pub use request::{Complexity, Priority, RequestContext, RouteRequest, RoutedResponse, TaskKind};
pub use resilience::{
    AttemptFailure, CircuitSnapshot, CircuitStatus, ResilientRouter, SkipReason, SkippedBackend,
};
pub use routing::{OptimizationPlan, Rejection, Selector, SelectorConfig};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_backend_router::{init_tracing, RouterError};
/// # fn example() -> Result<(), RouterError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level router errors.
///
/// Only [`RouterError::NoCandidate`], [`RouterError::AllBackendsExhausted`]
/// and [`RouterError::DeadlineExceeded`] are terminal outcomes of a routed
/// request. Per-attempt failures ([`RouterError::BackendTimeout`],
/// [`RouterError::BackendCall`]) are absorbed by retry and fallback and only
/// reach the caller inside an exhaustion report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// No enabled backend satisfies every hard constraint of the request.
    ///
    /// Not retried automatically; the caller should relax constraints.
    #[error("no backend satisfies the constraints for task '{task}' ({} rejected)", .rejected.len())]
    NoCandidate {
        /// Task kind that was requested.
        task: TaskKind,
        /// Every backend that was considered, with the constraint it failed.
        rejected: Vec<Rejection>,
    },

    /// A single attempt exceeded its deadline.
    #[error("backend '{backend}' timed out after {timeout_ms}ms")]
    BackendTimeout {
        /// Backend that timed out.
        backend: String,
        /// Deadline applied to the attempt.
        timeout_ms: u64,
    },

    /// A single attempt returned an error.
    #[error("backend '{backend}' call failed: {message}")]
    BackendCall {
        /// Backend that failed.
        backend: String,
        /// Error reported by the provider adapter.
        message: String,
    },

    /// Every backend in the fallback chain failed or was skipped.
    #[error("all backends exhausted (attempted: [{}], skipped: {})", attempted_names(.failures).join(", "), .skipped.len())]
    AllBackendsExhausted {
        /// One entry per backend that was actually attempted, in chain order.
        failures: Vec<AttemptFailure>,
        /// Backends that were skipped without an attempt.
        skipped: Vec<SkippedBackend>,
    },

    /// The request's overall latency budget ran out while walking the chain.
    #[error("request deadline exceeded after {elapsed_ms}ms (attempted: {attempted:?})")]
    DeadlineExceeded {
        /// Wall-clock time spent before aborting.
        elapsed_ms: u64,
        /// Backends attempted before the deadline passed.
        attempted: Vec<String>,
    },

    /// A backend name is not present in the catalog.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// A backend with the same name is already registered.
    #[error("backend already registered: {0}")]
    DuplicateBackend(String),

    /// A backend descriptor failed validation at registration time.
    #[error("invalid backend descriptor: {0}")]
    InvalidBackend(String),

    /// The inbound request was malformed (empty prompt, out-of-range constraint).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl RouterError {
    /// Names of the backends that were actually attempted before this error,
    /// in chain order. Empty for errors raised before execution.
    pub fn attempted_backends(&self) -> Vec<String> {
        match self {
            Self::AllBackendsExhausted { failures, .. } => attempted_names(failures),
            Self::DeadlineExceeded { attempted, .. } => attempted.clone(),
            _ => Vec::new(),
        }
    }

    /// Return `true` for errors that end a routed request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoCandidate { .. } | Self::AllBackendsExhausted { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

fn attempted_names(failures: &[AttemptFailure]) -> Vec<String> {
    failures.iter().map(|f| f.backend.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_includes_message() {
        let err = RouterError::ConfigError("cache.max_entries must be > 0".to_string());
        assert!(err.to_string().contains("cache.max_entries"));
    }

    #[test]
    fn test_exhausted_display_lists_attempted_backends() {
        let err = RouterError::AllBackendsExhausted {
            failures: vec![
                AttemptFailure {
                    backend: "alpha".to_string(),
                    calls: 3,
                    last_error: RouterError::BackendCall {
                        backend: "alpha".to_string(),
                        message: "503".to_string(),
                    }
                    .to_string(),
                },
                AttemptFailure {
                    backend: "beta".to_string(),
                    calls: 1,
                    last_error: "timeout".to_string(),
                },
            ],
            skipped: vec![],
        };
        let text = err.to_string();
        assert!(text.contains("alpha, beta"), "got: {text}");
        assert_eq!(err.attempted_backends(), vec!["alpha", "beta"]);
        assert!(err.is_terminal());
    }

    #[test]
    fn test_no_candidate_is_terminal_with_no_attempts() {
        let err = RouterError::NoCandidate {
            task: TaskKind::Code,
            rejected: vec![],
        };
        assert!(err.is_terminal());
        assert!(err.attempted_backends().is_empty());
        assert!(err.to_string().contains("code"));
    }

    #[test]
    fn test_backend_call_is_not_terminal() {
        let err = RouterError::BackendCall {
            backend: "x".to_string(),
            message: "boom".to_string(),
        };
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
