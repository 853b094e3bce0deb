//! Fallback-chain execution.
//!
//! [`ResilientRouter::execute`] walks an [`OptimizationPlan`]'s chain in
//! order, skipping backends that are open, unhealthy or unservable,
//! retrying transient failures on the same backend, and returning the first
//! success.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreakers;
use super::deadline::Deadline;
use super::health::HealthCache;
use super::retry::RetryPolicy;
use crate::backend::{Backend, BackendRequest, BackendResponse, ProviderRegistry};
use crate::catalog::{BackendCatalog, BackendDescriptor};
use crate::learning::{estimate_quality, LearningStore, OutcomeRecord};
use crate::metrics;
use crate::request::{RouteRequest, RoutedResponse};
use crate::routing::OptimizationPlan;
use crate::RouterError;

/// Why a backend in the chain was passed over without a call.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Circuit is open; a probe is allowed after `retry_after`.
    CircuitOpen {
        /// Remaining cool-down.
        retry_after: Duration,
    },
    /// Cached health verdict is unhealthy.
    Unhealthy,
    /// No adapter is registered for the backend's provider.
    NoProvider,
    /// The backend is no longer in the catalog.
    NotInCatalog,
    /// The backend was disabled after the plan was made.
    Disabled,
}

impl SkipReason {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Unhealthy => "unhealthy",
            Self::NoProvider => "no_provider",
            Self::NotInCatalog => "not_in_catalog",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { retry_after } => {
                write!(f, "circuit open (retry after {}ms)", retry_after.as_millis())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// A backend skipped without an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedBackend {
    /// Backend name.
    pub backend: String,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Final failure of one attempted backend, after its retries.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    /// Backend name.
    pub backend: String,
    /// Individual calls made (first call plus retries).
    pub calls: u32,
    /// Error of the last call.
    pub last_error: String,
}

enum AttemptError {
    /// The deadline left no time for even one call.
    NoTime,
    /// At least one call was made and the last one failed.
    Failed { calls: u32, last_error: String },
}

/// Executes plans with breaker, health, timeout, retry and fallback.
#[derive(Debug, Clone)]
pub struct ResilientRouter {
    catalog: Arc<BackendCatalog>,
    providers: ProviderRegistry,
    breakers: CircuitBreakers,
    health: HealthCache,
    learning: LearningStore,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ResilientRouter {
    /// Assemble a router from shared stores.
    pub fn new(
        catalog: Arc<BackendCatalog>,
        providers: ProviderRegistry,
        breakers: CircuitBreakers,
        health: HealthCache,
        learning: LearningStore,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            providers,
            breakers,
            health,
            learning,
            retry,
            call_timeout,
        }
    }

    /// Breaker registry.
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Health cache.
    pub fn health(&self) -> &HealthCache {
        &self.health
    }

    fn skip(&self, skipped: &mut Vec<SkippedBackend>, backend: &str, reason: SkipReason) {
        debug!(backend, reason = %reason, "backend skipped");
        metrics::inc_skip(backend, reason.as_str());
        skipped.push(SkippedBackend {
            backend: backend.to_string(),
            reason,
        });
    }

    /// Walk the plan's chain until one backend succeeds.
    ///
    /// The request's `max_latency` is the overall deadline. One outcome is
    /// recorded per attempted backend; skipped backends record nothing.
    ///
    /// # Errors
    ///
    /// - [`RouterError::DeadlineExceeded`] if the deadline passes before a
    ///   success.
    /// - [`RouterError::AllBackendsExhausted`] if every backend failed or was
    ///   skipped.
    pub async fn execute(
        &self,
        plan: &OptimizationPlan,
        request: &RouteRequest,
    ) -> Result<RoutedResponse, RouterError> {
        let deadline = Deadline::new(request.context.max_latency);
        let mut attempted: Vec<String> = Vec::new();
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut skipped: Vec<SkippedBackend> = Vec::new();

        for (position, name) in plan.chain().enumerate() {
            if deadline.is_expired() {
                return Err(self.deadline_exceeded(&deadline, attempted));
            }

            let Some(descriptor) = self.catalog.get(name) else {
                self.skip(&mut skipped, name, SkipReason::NotInCatalog);
                continue;
            };
            if !self.catalog.is_enabled(name) {
                self.skip(&mut skipped, name, SkipReason::Disabled);
                continue;
            }
            let Some(provider) = self.providers.get(&descriptor.provider) else {
                self.skip(&mut skipped, name, SkipReason::NoProvider);
                continue;
            };
            if let Err(retry_after) = self.breakers.check(name).await {
                self.skip(&mut skipped, name, SkipReason::CircuitOpen { retry_after });
                continue;
            }
            match self.health.is_healthy(name, &provider, &deadline).await {
                Some(true) => {}
                Some(false) => {
                    self.skip(&mut skipped, name, SkipReason::Unhealthy);
                    continue;
                }
                None => return Err(self.deadline_exceeded(&deadline, attempted)),
            }
            if deadline.is_expired() {
                return Err(self.deadline_exceeded(&deadline, attempted));
            }

            attempted.push(name.to_string());
            let started = Instant::now();
            match self.attempt(&descriptor, &provider, request, &deadline).await {
                Ok((response, calls)) => {
                    let quality = response
                        .quality
                        .unwrap_or_else(|| estimate_quality(descriptor.quality, &response.content))
                        .clamp(0.0, 1.0);
                    let cost = descriptor.cost_for(response.usage.input_tokens, response.usage.output_tokens);
                    self.learning.record(OutcomeRecord::success(
                        &request.request_id,
                        name,
                        request.context.task,
                        cost,
                        started.elapsed(),
                        quality,
                    ));
                    if position > 0 {
                        metrics::inc_fallback(request.context.task.as_str());
                    }
                    info!(
                        request_id = %request.request_id,
                        backend = name,
                        calls,
                        fallbacks_used = position,
                        cost,
                        "request served"
                    );
                    return Ok(RoutedResponse {
                        content: response.content,
                        backend_used: name.to_string(),
                        actual_cost: cost,
                        latency: deadline.elapsed(),
                        quality_estimate: quality,
                        cached: false,
                        backends_attempted: attempted,
                        fallbacks_used: position,
                        usage: response.usage,
                    });
                }
                Err(AttemptError::NoTime) => {
                    attempted.pop();
                    return Err(self.deadline_exceeded(&deadline, attempted));
                }
                Err(AttemptError::Failed { calls, last_error }) => {
                    warn!(
                        request_id = %request.request_id,
                        backend = name,
                        calls,
                        error = %last_error,
                        "backend attempt failed"
                    );
                    self.learning.record(OutcomeRecord::failure(
                        &request.request_id,
                        name,
                        request.context.task,
                        started.elapsed(),
                        last_error.clone(),
                    ));
                    failures.push(AttemptFailure {
                        backend: name.to_string(),
                        calls,
                        last_error,
                    });
                }
            }
        }

        if deadline.is_expired() && !attempted.is_empty() {
            return Err(self.deadline_exceeded(&deadline, attempted));
        }
        warn!(
            request_id = %request.request_id,
            attempted = failures.len(),
            skipped = skipped.len(),
            "all backends exhausted"
        );
        Err(RouterError::AllBackendsExhausted { failures, skipped })
    }

    fn deadline_exceeded(&self, deadline: &Deadline, attempted: Vec<String>) -> RouterError {
        warn!(elapsed_ms = deadline.elapsed().as_millis() as u64, ?attempted, "request deadline exceeded");
        RouterError::DeadlineExceeded {
            elapsed_ms: deadline.elapsed().as_millis() as u64,
            attempted,
        }
    }

    /// Call one backend, retrying transient failures.
    async fn attempt(
        &self,
        descriptor: &BackendDescriptor,
        provider: &Arc<dyn Backend>,
        request: &RouteRequest,
        deadline: &Deadline,
    ) -> Result<(BackendResponse, u32), AttemptError> {
        let name = descriptor.name.as_str();
        let (_, max_output_tokens) = request.context.complexity.token_volume();
        let call = BackendRequest {
            backend: name.to_string(),
            request_id: request.request_id.clone(),
            prompt: request.prompt.clone(),
            task: request.context.task,
            max_output_tokens,
        };

        let mut calls = 0_u32;
        let mut last_error = String::new();
        loop {
            let timeout = deadline.call_timeout(self.call_timeout);
            if timeout.is_zero() {
                if calls == 0 {
                    return Err(AttemptError::NoTime);
                }
                return Err(AttemptError::Failed { calls, last_error });
            }

            calls += 1;
            let call_started = Instant::now();
            let retryable = match tokio::time::timeout(timeout, provider.execute(&call)).await {
                Ok(Ok(response)) => {
                    metrics::record_backend_call(name, "success", call_started.elapsed());
                    self.breakers.record_success(name).await;
                    return Ok((response, calls));
                }
                Ok(Err(e)) => {
                    metrics::record_backend_call(name, "error", call_started.elapsed());
                    self.breakers.record_failure(name).await;
                    let retryable = e.is_retryable();
                    last_error = RouterError::BackendCall {
                        backend: name.to_string(),
                        message: e.to_string(),
                    }
                    .to_string();
                    retryable
                }
                Err(_) => {
                    metrics::record_backend_call(name, "timeout", call_started.elapsed());
                    self.breakers.record_failure(name).await;
                    last_error = RouterError::BackendTimeout {
                        backend: name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .to_string();
                    true
                }
            };

            if !retryable || calls > self.retry.max_retries {
                return Err(AttemptError::Failed { calls, last_error });
            }
            if self.breakers.is_open(name).await {
                debug!(backend = name, calls, "circuit opened; abandoning retries");
                return Err(AttemptError::Failed { calls, last_error });
            }
            let delay = self.retry.delay_for(calls);
            if !deadline.allows(delay) {
                debug!(backend = name, calls, delay_ms = delay.as_millis() as u64, "no time left to retry");
                return Err(AttemptError::Failed { calls, last_error });
            }
            debug!(backend = name, retry = calls, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
