//! # Backend Catalog
//!
//! ## Responsibility
//! Registry of [`BackendDescriptor`]s: identity, pricing, latency, quality
//! and per-task capability ratings. Decouples backend identity from scoring.
//!
//! ## Guarantees
//! - Sharded: entries live in a `DashMap`, so updating one backend never
//!   blocks readers or writers of another.
//! - Ordered: listings come back in registration order, which is the
//!   selector's tie-breaker.
//! - Bounded quality: every quality mutation is clamped to `[0.0, 1.0]`.
//!
//! ## NOT Responsible For
//! - Scoring or ranking (that belongs to `routing`)
//! - Calling backends (that belongs to `backend` / `resilience`)

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::request::{Complexity, TaskKind};
use crate::RouterError;

/// Performance rating of a backend for one task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityScore {
    /// Task kind the rating applies to.
    pub task: TaskKind,
    /// Rating in `[0.0, 1.0]`.
    pub score: f64,
}

/// Static description of one backend (provider + model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BackendDescriptor {
    /// Unique backend name, passed to the provider adapter as the model id.
    pub name: String,
    /// Provider adapter that serves this backend.
    pub provider: String,
    /// Price per input token in USD.
    pub input_cost_per_token: f64,
    /// Price per output token in USD.
    pub output_cost_per_token: f64,
    /// Maximum context window in tokens.
    pub max_context_tokens: u64,
    /// Nominal latency for a low-complexity request, in milliseconds.
    pub nominal_latency_ms: u64,
    /// Quality score in `[0.0, 1.0]`; nudged by outcome feedback.
    pub quality: f64,
    /// Per-task performance ratings.
    #[serde(default)]
    pub capabilities: Vec<CapabilityScore>,
}

impl BackendDescriptor {
    /// Create a descriptor with a single price for input and output tokens
    /// and no capabilities; add them with [`BackendDescriptor::with_capability`].
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        cost_per_token: f64,
        nominal_latency_ms: u64,
        quality: f64,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            input_cost_per_token: cost_per_token,
            output_cost_per_token: cost_per_token,
            max_context_tokens: 128_000,
            nominal_latency_ms,
            quality,
            capabilities: Vec::new(),
        }
    }

    /// Set distinct input/output prices.
    pub fn with_pricing(mut self, input_cost_per_token: f64, output_cost_per_token: f64) -> Self {
        self.input_cost_per_token = input_cost_per_token;
        self.output_cost_per_token = output_cost_per_token;
        self
    }

    /// Set the context window.
    pub fn with_max_context(mut self, max_context_tokens: u64) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }

    /// Declare (or replace) a capability rating.
    pub fn with_capability(mut self, task: TaskKind, score: f64) -> Self {
        self.capabilities.retain(|c| c.task != task);
        self.capabilities.push(CapabilityScore { task, score });
        self
    }

    /// Rating for `task`, falling back to the `general` rating.
    ///
    /// Returns `None` when the backend declares neither.
    pub fn capability_for(&self, task: TaskKind) -> Option<f64> {
        let lookup = |t: TaskKind| self.capabilities.iter().find(|c| c.task == t).map(|c| c.score);
        lookup(task).or_else(|| lookup(TaskKind::General))
    }

    /// Estimated USD cost of a request at `complexity`.
    pub fn estimate_cost(&self, complexity: Complexity) -> f64 {
        let (input, output) = complexity.token_volume();
        input as f64 * self.input_cost_per_token + output as f64 * self.output_cost_per_token
    }

    /// Actual USD cost for observed token usage.
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_cost_per_token + output_tokens as f64 * self.output_cost_per_token
    }

    /// Nominal latency scaled by the complexity multiplier, in milliseconds.
    pub fn estimate_latency_ms(&self, complexity: Complexity) -> f64 {
        self.nominal_latency_ms as f64 * complexity.latency_multiplier()
    }

    /// Check descriptor invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidBackend`] describing the first violation.
    pub fn validate(&self) -> Result<(), RouterError> {
        let fail = |msg: String| Err(RouterError::InvalidBackend(format!("{}: {msg}", self.name)));
        if self.name.trim().is_empty() {
            return Err(RouterError::InvalidBackend("name must not be empty".to_string()));
        }
        if self.provider.trim().is_empty() {
            return fail("provider must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return fail(format!("quality must be in [0.0, 1.0], got {}", self.quality));
        }
        if !(self.input_cost_per_token >= 0.0 && self.output_cost_per_token >= 0.0) {
            return fail("token costs must be >= 0".to_string());
        }
        if let Some(c) = self.capabilities.iter().find(|c| !(0.0..=1.0).contains(&c.score)) {
            return fail(format!("capability '{}' score must be in [0.0, 1.0], got {}", c.task, c.score));
        }
        Ok(())
    }
}

/// Admin view of a catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStatus {
    /// Current descriptor, including live quality.
    pub descriptor: BackendDescriptor,
    /// Whether the backend is offered to the selector.
    pub enabled: bool,
}

#[derive(Debug)]
struct CatalogEntry {
    descriptor: BackendDescriptor,
    enabled: bool,
    order: usize,
}

/// Concurrent backend registry.
///
/// # Example
///
/// ```rust
/// use tokio_backend_router::{BackendCatalog, BackendDescriptor, TaskKind};
///
/// let catalog = BackendCatalog::new();
/// catalog
///     .register(BackendDescriptor::new("small", "echo", 0.000_001, 300, 0.7).with_capability(TaskKind::General, 0.6))
///     .unwrap();
/// assert_eq!(catalog.list_enabled().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct BackendCatalog {
    entries: DashMap<String, CatalogEntry>,
    next_order: AtomicUsize,
}

impl BackendCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidBackend`] if the descriptor fails validation.
    /// - [`RouterError::DuplicateBackend`] if the name is already registered.
    pub fn register(&self, descriptor: BackendDescriptor) -> Result<(), RouterError> {
        descriptor.validate()?;
        match self.entries.entry(descriptor.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RouterError::DuplicateBackend(descriptor.name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let order = self.next_order.fetch_add(1, Ordering::Relaxed);
                info!(backend = %descriptor.name, provider = %descriptor.provider, "backend registered");
                slot.insert(CatalogEntry {
                    descriptor,
                    enabled: true,
                    order,
                });
                Ok(())
            }
        }
    }

    /// Snapshot of a backend's descriptor, enabled or not.
    pub fn get(&self, name: &str) -> Option<BackendDescriptor> {
        self.entries.get(name).map(|e| e.descriptor.clone())
    }

    /// Whether `name` is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries.get(name).map(|e| e.enabled).unwrap_or(false)
    }

    /// Enabled backends in registration order.
    pub fn list_enabled(&self) -> Vec<BackendDescriptor> {
        let mut items: Vec<(usize, BackendDescriptor)> = self
            .entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| (e.order, e.descriptor.clone()))
            .collect();
        items.sort_by_key(|(order, _)| *order);
        items.into_iter().map(|(_, d)| d).collect()
    }

    /// Every backend with its enabled flag, in registration order.
    pub fn list_all(&self) -> Vec<BackendStatus> {
        let mut items: Vec<(usize, BackendStatus)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.order,
                    BackendStatus {
                        descriptor: e.descriptor.clone(),
                        enabled: e.enabled,
                    },
                )
            })
            .collect();
        items.sort_by_key(|(order, _)| *order);
        items.into_iter().map(|(_, s)| s).collect()
    }

    /// Remove a backend from candidate lists without deleting it.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendNotFound`] for unknown names.
    pub fn disable(&self, name: &str) -> Result<(), RouterError> {
        self.set_enabled(name, false)
    }

    /// Re-enable a previously disabled backend.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendNotFound`] for unknown names.
    pub fn enable(&self, name: &str) -> Result<(), RouterError> {
        self.set_enabled(name, true)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RouterError> {
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| RouterError::BackendNotFound(name.to_string()))?;
        entry.enabled = enabled;
        info!(backend = name, enabled, "backend availability changed");
        Ok(())
    }

    /// Apply `update` to a backend's quality under that entry's lock.
    ///
    /// The result is clamped to `[0.0, 1.0]`; NaN results leave the score
    /// unchanged. Returns the new score, or `None` for unknown names.
    pub fn adjust_quality<F>(&self, name: &str, update: F) -> Option<f64>
    where
        F: FnOnce(f64) -> f64,
    {
        let mut entry = self.entries.get_mut(name)?;
        let old = entry.descriptor.quality;
        let new = update(old);
        if new.is_finite() {
            entry.descriptor.quality = new.clamp(0.0, 1.0);
        }
        debug!(backend = name, old, new = entry.descriptor.quality, "quality adjusted");
        Some(entry.descriptor.quality)
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
