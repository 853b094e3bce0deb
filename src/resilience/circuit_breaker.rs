//! Per-backend circuit breakers.
//!
//! ## States
//! - **Closed**: calls flow through; failures are counted inside a sliding
//!   window and a success clears the count.
//! - **Open**: the backend is skipped until the cool-down elapses.
//! - **Half-Open**: the cool-down has elapsed; the next call is a probe.
//!   Success closes the circuit, failure re-opens it with a fresh cool-down.
//!
//! Breakers are created lazily per backend name and live in a sharded map,
//! so a busy backend never contends with another backend's breaker.

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics;

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_ms() -> u64 {
    60_000
}

fn default_cooldown_ms() -> u64 {
    60_000
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit. Default: `5`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window for counting failures, in milliseconds. Default: 60 s.
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    /// Time an open circuit waits before allowing a probe. Default: 60 s.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    fn window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are skipped until the cool-down elapses.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl CircuitStatus {
    /// Gauge value published to metrics.
    pub fn code(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Read-only view of one backend's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    /// Backend name.
    pub backend: String,
    /// Effective status. An open circuit whose cool-down has elapsed
    /// reports `HalfOpen`.
    pub status: CircuitStatus,
    /// Failures counted in the current window.
    pub failures: u32,
    /// Time until a probe is allowed, for open circuits.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    failure_times: VecDeque<Instant>,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_times: VecDeque::new(),
            last_failure_time: None,
            opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.failure_times.front() {
            if now.duration_since(*front) > window {
                self.failure_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_cooldown(&self, now: Instant, cooldown: Duration) -> Duration {
        self.opened_at
            .map(|at| cooldown.saturating_sub(now.duration_since(at)))
            .unwrap_or(Duration::ZERO)
    }
}

/// Breaker for a single backend.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<RwLock<CircuitState>>,
    config: BreakerConfig,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker for `name`.
    pub fn new(name: impl Into<Arc<str>>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(CircuitState::new())),
            config,
        }
    }

    /// Whether a call may go through now.
    ///
    /// Moves an open circuit to half-open once the cool-down has elapsed.
    ///
    /// # Errors
    ///
    /// Returns the remaining cool-down while the circuit is open.
    pub async fn check(&self) -> Result<(), Duration> {
        let mut state = self.state.write().await;
        if state.status != CircuitStatus::Open {
            return Ok(());
        }
        let remaining = state.remaining_cooldown(Instant::now(), self.config.cooldown());
        if remaining.is_zero() {
            state.status = CircuitStatus::HalfOpen;
            info!(backend = %self.name, "circuit breaker: transitioning to half-open");
            metrics::set_circuit_state(&self.name, CircuitStatus::HalfOpen.code());
            Ok(())
        } else {
            debug!(backend = %self.name, retry_after_ms = remaining.as_millis() as u64, "circuit breaker: open");
            Err(remaining)
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        match state.status {
            CircuitStatus::HalfOpen | CircuitStatus::Open => {
                state.status = CircuitStatus::Closed;
                state.failure_times.clear();
                state.opened_at = None;
                info!(backend = %self.name, "circuit breaker: closing (backend recovered)");
                metrics::set_circuit_state(&self.name, CircuitStatus::Closed.code());
            }
            CircuitStatus::Closed => {
                state.failure_times.clear();
            }
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.prune(now, self.config.window());
        state.failure_times.push_back(now);
        state.last_failure_time = Some(now);

        let failures = state.failure_times.len() as u32;
        debug!(
            backend = %self.name,
            status = %state.status,
            failures,
            threshold = self.config.failure_threshold,
            "circuit breaker: failure recorded"
        );

        match state.status {
            CircuitStatus::Closed if failures >= self.config.failure_threshold => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                warn!(
                    backend = %self.name,
                    failures,
                    threshold = self.config.failure_threshold,
                    "circuit breaker: opening (threshold exceeded)"
                );
                metrics::set_circuit_state(&self.name, CircuitStatus::Open.code());
            }
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                warn!(backend = %self.name, "circuit breaker: reopening (half-open probe failed)");
                metrics::set_circuit_state(&self.name, CircuitStatus::Open.code());
            }
            _ => {}
        }
    }

    /// Whether the circuit is currently open (cool-down not elapsed).
    pub async fn is_open(&self) -> bool {
        let state = self.state.read().await;
        state.status == CircuitStatus::Open
            && !state.remaining_cooldown(Instant::now(), self.config.cooldown()).is_zero()
    }

    /// Point-in-time view of the breaker.
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let state = self.state.read().await;
        let window = self.config.window();
        let failures = state
            .failure_times
            .iter()
            .filter(|t| now.duration_since(**t) <= window)
            .count() as u32;
        let (status, retry_after) = match state.status {
            CircuitStatus::Open => {
                let remaining = state.remaining_cooldown(now, self.config.cooldown());
                if remaining.is_zero() {
                    (CircuitStatus::HalfOpen, None)
                } else {
                    (CircuitStatus::Open, Some(remaining))
                }
            }
            other => (other, None),
        };
        CircuitSnapshot {
            backend: self.name.to_string(),
            status,
            failures,
            retry_after,
        }
    }

    /// Manually reset the breaker to closed.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::new();
        info!(backend = %self.name, "circuit breaker: manually reset to closed");
        metrics::set_circuit_state(&self.name, CircuitStatus::Closed.code());
    }

    /// Force the breaker open with a fresh cool-down.
    pub async fn trip(&self) {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.status = CircuitStatus::Open;
        state.opened_at = Some(now);
        state.last_failure_time = Some(now);
        warn!(backend = %self.name, "circuit breaker: manually tripped to open");
        metrics::set_circuit_state(&self.name, CircuitStatus::Open.code());
    }
}

/// Lazily populated breaker per backend name.
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    config: BreakerConfig,
}

impl CircuitBreakers {
    /// Create an empty registry; every breaker uses `config`.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Breaker for `backend`, created closed on first use.
    pub fn get(&self, backend: &str) -> CircuitBreaker {
        if let Some(b) = self.breakers.get(backend) {
            return b.clone();
        }
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| CircuitBreaker::new(backend, self.config.clone()))
            .clone()
    }

    /// See [`CircuitBreaker::check`].
    ///
    /// # Errors
    ///
    /// Returns the remaining cool-down while the circuit is open.
    pub async fn check(&self, backend: &str) -> Result<(), Duration> {
        self.get(backend).check().await
    }

    /// Record a successful call for `backend`.
    pub async fn record_success(&self, backend: &str) {
        self.get(backend).record_success().await;
    }

    /// Record a failed call for `backend`.
    pub async fn record_failure(&self, backend: &str) {
        self.get(backend).record_failure().await;
    }

    /// Whether `backend`'s circuit is open.
    pub async fn is_open(&self, backend: &str) -> bool {
        match self.breakers.get(backend).map(|b| b.clone()) {
            Some(b) => b.is_open().await,
            None => false,
        }
    }

    /// Snapshot for `backend` (closed and empty if never used).
    pub async fn snapshot(&self, backend: &str) -> CircuitSnapshot {
        self.get(backend).snapshot().await
    }

    /// Snapshots of every breaker created so far, sorted by backend name.
    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<CircuitBreaker> = self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(breakers.len());
        for b in breakers {
            out.push(b.snapshot().await);
        }
        out.sort_by(|a, b| a.backend.cmp(&b.backend));
        out
    }

    /// Reset `backend`'s breaker to closed.
    pub async fn reset(&self, backend: &str) {
        self.get(backend).reset().await;
    }

    /// Force `backend`'s breaker open.
    pub async fn trip(&self, backend: &str) {
        self.get(backend).trip().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 60_000,
            cooldown_ms,
        }
    }

    #[tokio::test]
    async fn test_circuit_opens_on_failures() {
        let breaker = CircuitBreaker::new("a", config(3, 5_000));
        for _ in 0..3 {
            assert!(breaker.check().await.is_ok());
            breaker.record_failure().await;
        }
        let snap = breaker.snapshot().await;
        assert_eq!(snap.status, CircuitStatus::Open);
        assert_eq!(snap.failures, 3);
        assert!(snap.retry_after.is_some());
        assert!(breaker.check().await.is_err());
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn test_success_clears_failure_count() {
        let breaker = CircuitBreaker::new("a", config(3, 5_000));
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.snapshot().await.status, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new(
            "a",
            BreakerConfig {
                failure_threshold: 2,
                failure_window_ms: 30,
                cooldown_ms: 5_000,
            },
        );
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.record_failure().await;
        assert_eq!(breaker.snapshot().await.status, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("a", config(2, 50));
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert!(breaker.check().await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.snapshot().await.status, CircuitStatus::HalfOpen);
        assert!(breaker.check().await.is_ok());
        breaker.record_success().await;
        let snap = breaker.snapshot().await;
        assert_eq!(snap.status, CircuitStatus::Closed);
        assert_eq!(snap.failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new("a", config(2, 50));
        breaker.record_failure().await;
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.check().await.is_ok());
        breaker.record_failure().await;
        let snap = breaker.snapshot().await;
        assert_eq!(snap.status, CircuitStatus::Open);
        assert!(snap.retry_after.unwrap_or_default() > Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_manual_reset_and_trip() {
        let breakers = CircuitBreakers::new(config(2, 60_000));
        breakers.trip("a").await;
        assert!(breakers.is_open("a").await);
        breakers.reset("a").await;
        assert!(!breakers.is_open("a").await);
        assert_eq!(breakers.snapshot("a").await.status, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_registry_isolates_backends() {
        let breakers = CircuitBreakers::new(config(1, 60_000));
        breakers.record_failure("a").await;
        assert!(breakers.check("a").await.is_err());
        assert!(breakers.check("b").await.is_ok());
        let names: Vec<String> = breakers.snapshots().await.into_iter().map(|s| s.backend).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_not_open() {
        let breakers = CircuitBreakers::new(BreakerConfig::default());
        assert!(!breakers.is_open("ghost").await);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CircuitStatus::Closed.code(), 0);
        assert_eq!(CircuitStatus::HalfOpen.code(), 1);
        assert_eq!(CircuitStatus::Open.code(), 2);
        assert_eq!(CircuitStatus::HalfOpen.to_string(), "half_open");
    }
}
