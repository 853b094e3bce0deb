//! Learning store: outcome ingestion, quality nudging and the outcome feed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::history::{OutcomeHistory, OutcomeRecord, PerformanceStats};
use crate::catalog::BackendCatalog;
use crate::metrics;
use crate::request::TaskKind;

fn default_history_capacity() -> usize {
    10_000
}

fn default_stats_window() -> usize {
    50
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_feed_capacity() -> usize {
    1_024
}

/// Learning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LearningConfig {
    /// Maximum outcome records retained in the ring.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Records per (backend, task) used for statistics.
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    /// Fraction of the gap between stored and observed quality applied per
    /// successful outcome.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Buffered events per outcome feed subscriber.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            stats_window: default_stats_window(),
            learning_rate: default_learning_rate(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

/// Move `old` toward `observed` by `rate` of the gap, clamped to `[0.0, 1.0]`.
///
/// Non-finite inputs leave `old` unchanged (clamped).
///
/// ```rust
/// use tokio_backend_router::learning::nudge_quality;
///
/// let q = nudge_quality(0.5, 1.0, 0.1);
/// assert!((q - 0.55).abs() < 1e-9);
/// ```
pub fn nudge_quality(old: f64, observed: f64, rate: f64) -> f64 {
    let old = if old.is_finite() { old.clamp(0.0, 1.0) } else { 0.0 };
    if !observed.is_finite() || !rate.is_finite() {
        return old;
    }
    let observed = observed.clamp(0.0, 1.0);
    let rate = rate.clamp(0.0, 1.0);
    (old + (observed - old) * rate).clamp(0.0, 1.0)
}

/// Heuristic quality of a response when the adapter reports none.
///
/// Empty content scores zero. Otherwise the backend's stored quality is
/// blended with a length signal (saturating at 200 characters) and a
/// termination signal (content ending on sentence or block punctuation).
pub fn estimate_quality(backend_quality: f64, content: &str) -> f64 {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let length = (trimmed.chars().count() as f64 / 200.0).min(1.0);
    let terminated = trimmed
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '!' | '?' | '`' | '"' | ')' | ']' | '}'))
        .unwrap_or(false);
    let termination = if terminated { 1.0 } else { 0.5 };
    (0.6 * backend_quality.clamp(0.0, 1.0) + 0.25 * length + 0.15 * termination).clamp(0.0, 1.0)
}

/// Records outcomes, derives statistics and feeds quality back into the
/// catalog.
///
/// Clone is cheap and all clones share state.
#[derive(Debug, Clone)]
pub struct LearningStore {
    history: Arc<OutcomeHistory>,
    catalog: Arc<BackendCatalog>,
    learning_rate: f64,
    feed: broadcast::Sender<OutcomeRecord>,
}

impl LearningStore {
    /// Create a store that nudges qualities in `catalog`.
    pub fn new(catalog: Arc<BackendCatalog>, config: &LearningConfig) -> Self {
        let (feed, _) = broadcast::channel(config.feed_capacity.max(1));
        Self {
            history: Arc::new(OutcomeHistory::new(config.history_capacity, config.stats_window.max(1))),
            catalog,
            learning_rate: config.learning_rate,
            feed,
        }
    }

    /// Ingest one outcome.
    ///
    /// Successful outcomes nudge the backend's catalog quality toward the
    /// observed quality. Failures are counted in statistics only; the
    /// breaker is the failure signal for routing.
    pub fn record(&self, record: OutcomeRecord) {
        if record.success {
            let rate = self.learning_rate;
            let observed = record.quality;
            if let Some(q) = self
                .catalog
                .adjust_quality(&record.backend, |old| nudge_quality(old, observed, rate))
            {
                debug!(backend = %record.backend, quality = q, "quality nudged");
            }
            metrics::add_cost(&record.backend, record.cost);
        }

        // Lagging or absent subscribers are not an error.
        let _ = self.feed.send(record.clone());
        self.history.push(record);
    }

    /// Recent statistics for (backend, task).
    pub fn stats(&self, backend: &str, task: TaskKind) -> Option<PerformanceStats> {
        self.history.stats(backend, task)
    }

    /// Most recent `n` outcomes, oldest first.
    pub fn recent(&self, n: usize) -> Vec<OutcomeRecord> {
        self.history.recent(n)
    }

    /// Subscribe to the live outcome feed.
    ///
    /// Slow subscribers lose the oldest events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeRecord> {
        self.feed.subscribe()
    }

    /// Size of the statistics window.
    pub fn window(&self) -> usize {
        self.history.window()
    }

    /// Number of records retained.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Return `true` if no outcome has been recorded.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
