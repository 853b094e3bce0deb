//! Cached backend health flags.
//!
//! A probe runs at most once per TTL per backend; the verdict is reused by
//! every request until it expires. Probes that exceed the probe timeout
//! count as unhealthy.

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::deadline::Deadline;
use crate::backend::Backend;

fn default_enabled() -> bool {
    true
}

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

/// Health-check tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthConfig {
    /// Probe backends before attempting them. Default: `true`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How long a verdict is reused, in milliseconds. Default: 30 s.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Probe timeout in milliseconds. Default: 2 s.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_ms: default_ttl_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthEntry {
    healthy: bool,
    checked_at: Instant,
}

/// TTL cache of health verdicts keyed by backend name.
#[derive(Debug, Clone)]
pub struct HealthCache {
    entries: Arc<DashMap<String, HealthEntry>>,
    config: HealthConfig,
}

impl HealthCache {
    /// Create an empty cache.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Cached verdict for `backend` if it has not expired.
    pub fn cached(&self, backend: &str) -> Option<bool> {
        let ttl = Duration::from_millis(self.config.ttl_ms);
        self.entries
            .get(backend)
            .filter(|e| e.checked_at.elapsed() < ttl)
            .map(|e| e.healthy)
    }

    /// Whether `backend` should be attempted, probing `provider` when the
    /// cached verdict is missing or stale.
    ///
    /// The probe is bounded by the smaller of the probe timeout and what is
    /// left of `deadline`. Returns `None` when the deadline runs out before a
    /// verdict is reached; nothing is cached in that case.
    pub async fn is_healthy(
        &self,
        backend: &str,
        provider: &Arc<dyn Backend>,
        deadline: &Deadline,
    ) -> Option<bool> {
        if !self.config.enabled {
            return Some(true);
        }
        if let Some(healthy) = self.cached(backend) {
            return Some(healthy);
        }

        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let budget = deadline.call_timeout(probe_timeout);
        if budget.is_zero() {
            return None;
        }
        let healthy = match tokio::time::timeout(budget, provider.is_healthy(backend)).await {
            Ok(h) => h,
            Err(_) if budget < probe_timeout => {
                debug!(backend, budget_ms = budget.as_millis() as u64, "health probe cut short by request deadline");
                return None;
            }
            Err(_) => {
                warn!(backend, timeout_ms = self.config.probe_timeout_ms, "health probe timed out");
                false
            }
        };
        debug!(backend, healthy, "health probed");
        self.mark(backend, healthy);
        Some(healthy)
    }

    /// Store a verdict for `backend`.
    pub fn mark(&self, backend: &str, healthy: bool) {
        self.entries.insert(
            backend.to_string(),
            HealthEntry {
                healthy,
                checked_at: Instant::now(),
            },
        );
    }

    /// Drop every cached verdict.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached verdicts, including expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
