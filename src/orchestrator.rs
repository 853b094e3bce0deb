//! # Stage: Request Orchestrator
//!
//! ## Responsibility
//! Public front door. Sanitizes a [`RouteRequest`], short-circuits on a
//! cache hit, coalesces identical in-flight requests, asks the [`Selector`]
//! for a plan, hands it to the [`ResilientRouter`] and caches the result.
//! Also batches structurally identical requests and exposes the admin
//! surface (circuits, health cache, cache, catalog, outcome feed).
//!
//! ## Guarantees
//! - Cache idempotence: a repeated fingerprint is served with
//!   `cached = true` and zero cost until the cache is cleared or expires.
//! - Identical concurrent requests trigger one backend execution when
//!   coalescing is enabled.
//! - Batch results come back in input order, one per request.
//!
//! ## NOT Responsible For
//! - Scoring (that belongs to `routing`)
//! - Breakers, retries and fallback (that belongs to `resilience`)

use futures::stream::{self, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

use crate::backend::{ProviderRegistry, TokenUsage};
use crate::cache::{fingerprint, CacheEntry, CacheStats, Flight, FlightResult, InFlight, ResponseCache};
use crate::catalog::{BackendCatalog, BackendDescriptor};
use crate::config::RouterConfig;
use crate::learning::{LearningStore, OutcomeRecord, PerformanceStats};
use crate::metrics;
use crate::request::{Complexity, Priority, RequestContext, RouteRequest, RoutedResponse, TaskKind};
use crate::resilience::{
    CircuitBreakers, CircuitSnapshot, CircuitStatus, HealthCache, ResilientRouter, RetryPolicy,
};
use crate::routing::{OptimizationPlan, Selector};
use crate::RouterError;

fn default_coalesce_in_flight() -> bool {
    true
}

fn default_batch_concurrency() -> usize {
    8
}

/// Front-door settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OrchestratorConfig {
    /// Coalesce identical concurrent requests into one execution.
    /// Default: `true`.
    #[serde(default = "default_coalesce_in_flight")]
    pub coalesce_in_flight: bool,
    /// Maximum batch members in flight at once. Default: `8`.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            coalesce_in_flight: default_coalesce_in_flight(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

/// Admin view of one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendView {
    /// Backend name.
    pub name: String,
    /// Provider adapter name.
    pub provider: String,
    /// Live quality score.
    pub quality: f64,
    /// Whether the selector may choose it.
    pub enabled: bool,
    /// Current circuit status.
    pub circuit: CircuitStatus,
}

/// Requests sharing a batch key share one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BatchKey {
    task: TaskKind,
    complexity: Complexity,
    priority: Priority,
    max_cost: u64,
    max_latency: Duration,
    min_quality: u64,
}

impl BatchKey {
    fn of(ctx: &RequestContext) -> Self {
        Self {
            task: ctx.task,
            complexity: ctx.complexity,
            priority: ctx.priority,
            max_cost: ctx.max_cost.to_bits(),
            max_latency: ctx.max_latency,
            min_quality: ctx.min_quality.to_bits(),
        }
    }
}

/// The router's public entry point.
///
/// Clone is cheap and all clones share state.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio_backend_router::config::RouterConfig;
/// use tokio_backend_router::{
///     BackendDescriptor, EchoBackend, ProviderRegistry, RequestContext, RequestOrchestrator,
///     RouteRequest, TaskKind,
/// };
///
/// # async fn example() -> Result<(), tokio_backend_router::RouterError> {
/// let mut config = RouterConfig::default();
/// config.backends.push(
///     BackendDescriptor::new("small", "echo", 0.000_001, 300, 0.8)
///         .with_capability(TaskKind::General, 0.7),
/// );
/// let providers = ProviderRegistry::new();
/// providers.register("echo", Arc::new(EchoBackend::new()));
///
/// let router = RequestOrchestrator::new(&config, providers)?;
/// let response = router
///     .process(RouteRequest::new("hello", RequestContext::new(TaskKind::Chat)))
///     .await?;
/// println!("{} via {}", response.content, response.backend_used);
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct RequestOrchestrator {
    catalog: Arc<BackendCatalog>,
    selector: Selector,
    router: ResilientRouter,
    cache: ResponseCache,
    learning: LearningStore,
    inflight: InFlight,
    config: OrchestratorConfig,
}

impl RequestOrchestrator {
    /// Build a router from configuration, registering every configured
    /// backend in a fresh catalog.
    ///
    /// # Errors
    ///
    /// - [`RouterError::ConfigError`] if the configuration is invalid.
    /// - [`RouterError::InvalidBackend`] / [`RouterError::DuplicateBackend`]
    ///   if a backend cannot be registered.
    pub fn new(config: &RouterConfig, providers: ProviderRegistry) -> Result<Self, RouterError> {
        crate::config::validation::validate(config).map_err(|errors| {
            RouterError::ConfigError(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let catalog = Arc::new(BackendCatalog::new());
        for descriptor in &config.backends {
            catalog.register(descriptor.clone())?;
        }
        Ok(Self::with_catalog(catalog, providers, config))
    }

    /// Build a router around an existing catalog. Backends listed in
    /// `config.backends` are ignored.
    pub fn with_catalog(
        catalog: Arc<BackendCatalog>,
        providers: ProviderRegistry,
        config: &RouterConfig,
    ) -> Self {
        let learning = LearningStore::new(Arc::clone(&catalog), &config.learning);
        let selector = Selector::new(Arc::clone(&catalog), learning.clone(), config.selector.clone());
        let router = ResilientRouter::new(
            Arc::clone(&catalog),
            providers,
            CircuitBreakers::new(config.resilience.breaker.clone()),
            HealthCache::new(config.resilience.health.clone()),
            learning.clone(),
            RetryPolicy::from_config(&config.resilience.retry),
            Duration::from_millis(config.resilience.call_timeout_ms),
        );
        Self {
            catalog,
            selector,
            router,
            cache: ResponseCache::new(config.cache.clone()),
            learning,
            inflight: InFlight::new(),
            config: config.orchestrator.clone(),
        }
    }

    /// Route one request.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidRequest`] for an empty prompt or out-of-range
    ///   constraints.
    /// - [`RouterError::NoCandidate`], [`RouterError::AllBackendsExhausted`]
    ///   or [`RouterError::DeadlineExceeded`] from planning and execution.
    pub async fn process(&self, request: RouteRequest) -> Result<RoutedResponse, RouterError> {
        let span = tracing::info_span!(
            "router.process",
            request_id = %request.request_id,
            task = %request.context.task,
            caller = request.context.caller_id.as_deref().unwrap_or("-"),
        );
        self.handle(request, None).instrument(span).await
    }

    /// Route many requests at once.
    ///
    /// Requests with the same task, complexity, priority and constraints are
    /// planned once per group; members then run concurrently, at most
    /// `batch_concurrency` at a time. Results are in input order.
    pub async fn process_batch(&self, requests: Vec<RouteRequest>) -> Vec<Result<RoutedResponse, RouterError>> {
        let mut plans: HashMap<BatchKey, Result<OptimizationPlan, RouterError>> = HashMap::new();
        for request in &requests {
            plans
                .entry(BatchKey::of(&request.context))
                .or_insert_with(|| self.selector.plan(&request.context));
        }
        info!(requests = requests.len(), groups = plans.len(), "batch planned");

        let plans = &plans;
        stream::iter(requests)
            .map(|request| async move {
                let planned = plans.get(&BatchKey::of(&request.context));
                let span = tracing::info_span!(
                    "router.batch_member",
                    request_id = %request.request_id,
                    task = %request.context.task,
                );
                self.handle(request, planned).instrument(span).await
            })
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    async fn handle(
        &self,
        mut request: RouteRequest,
        planned: Option<&Result<OptimizationPlan, RouterError>>,
    ) -> Result<RoutedResponse, RouterError> {
        let start = Instant::now();
        let task = request.context.task;
        let result = self.serve(&mut request, planned, start).await;
        let outcome = match &result {
            Ok(r) if r.cached => "cached",
            Ok(_) => "success",
            Err(RouterError::NoCandidate { .. }) => "no_candidate",
            Err(RouterError::AllBackendsExhausted { .. }) => "exhausted",
            Err(RouterError::DeadlineExceeded { .. }) => "deadline",
            Err(RouterError::InvalidRequest(_)) => "invalid",
            Err(_) => "error",
        };
        metrics::inc_request(task.as_str(), outcome);
        if let Err(e) = &result {
            warn!(outcome, error = %e, "request failed");
        }
        result
    }

    async fn serve(
        &self,
        request: &mut RouteRequest,
        planned: Option<&Result<OptimizationPlan, RouterError>>,
        start: Instant,
    ) -> Result<RoutedResponse, RouterError> {
        request.prompt = sanitize(&request.prompt)?;
        request
            .context
            .validate()
            .map_err(RouterError::InvalidRequest)?;

        let key = fingerprint(&request.prompt, &request.context);
        if let Some(entry) = self.cache.lookup(&key) {
            return Ok(from_cache(entry, start));
        }

        if !self.config.coalesce_in_flight {
            return self.route(request, &key, planned).await;
        }

        match self.inflight.join(&key) {
            Flight::Leader(guard) => {
                // The previous leader may have finished between our lookup and join.
                if let Some(entry) = self.cache.lookup(&key) {
                    let response = from_cache(entry, start);
                    guard.complete(Ok(response.clone()));
                    return Ok(response);
                }
                let result = self.route(request, &key, planned).await;
                guard.complete(result.clone());
                result
            }
            Flight::Follower(mut rx) => {
                let budget = request.context.max_latency.saturating_sub(start.elapsed());
                match tokio::time::timeout(budget, rx.recv()).await {
                    Err(_) => {
                        debug!(key = %key, budget_ms = budget.as_millis() as u64, "deadline passed waiting on in-flight leader");
                        Err(RouterError::DeadlineExceeded {
                            elapsed_ms: start.elapsed().as_millis() as u64,
                            attempted: Vec::new(),
                        })
                    }
                    Ok(received) => self.follow(received, request, &key, planned, start).await,
                }
            }
        }
    }

    /// Finish a follower once the leader has answered or gone away.
    async fn follow(
        &self,
        received: Result<FlightResult, broadcast::error::RecvError>,
        request: &RouteRequest,
        key: &str,
        planned: Option<&Result<OptimizationPlan, RouterError>>,
        start: Instant,
    ) -> Result<RoutedResponse, RouterError> {
        match received {
            Ok(Ok(shared)) => {
                debug!(key = %key, backend = %shared.backend_used, "served by in-flight leader");
                metrics::inc_cache_event("coalesced");
                Ok(as_shared(shared, start))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(key = %key, "in-flight leader gone, executing directly");
                self.route(request, key, planned).await
            }
        }
    }

    async fn route(
        &self,
        request: &RouteRequest,
        key: &str,
        planned: Option<&Result<OptimizationPlan, RouterError>>,
    ) -> Result<RoutedResponse, RouterError> {
        let fresh;
        let plan = match planned {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => return Err(e.clone()),
            None => {
                fresh = self.selector.plan(&request.context)?;
                &fresh
            }
        };

        let response = self.router.execute(plan, request).await?;
        self.cache.store(
            key,
            CacheEntry::new(
                response.content.clone(),
                response.backend_used.clone(),
                response.actual_cost,
                response.quality_estimate,
            ),
        );
        Ok(response)
    }

    // ── Admin ────────────────────────────────────────────────────────────

    /// Close a backend's circuit and clear its failures.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendNotFound`] for an unknown backend.
    pub async fn reset_circuit(&self, backend: &str) -> Result<(), RouterError> {
        self.known(backend)?;
        self.router.breakers().reset(backend).await;
        info!(backend, "circuit reset by operator");
        Ok(())
    }

    /// Force a backend's circuit open.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendNotFound`] for an unknown backend.
    pub async fn trip_circuit(&self, backend: &str) -> Result<(), RouterError> {
        self.known(backend)?;
        self.router.breakers().trip(backend).await;
        info!(backend, "circuit tripped by operator");
        Ok(())
    }

    /// Drop every cached health verdict so the next request re-probes.
    pub fn clear_health_cache(&self) {
        self.router.health().clear();
        debug!("health cache cleared");
    }

    /// Drop every cached response.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Response cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Every registered backend with live quality, enabled flag and circuit
    /// status, in registration order.
    pub async fn list_backends(&self) -> Vec<BackendView> {
        let mut views = Vec::new();
        for status in self.catalog.list_all() {
            let circuit = self.router.breakers().snapshot(&status.descriptor.name).await.status;
            views.push(BackendView {
                name: status.descriptor.name,
                provider: status.descriptor.provider,
                quality: status.descriptor.quality,
                enabled: status.enabled,
                circuit,
            });
        }
        views
    }

    /// Register an additional backend at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidBackend`] or
    /// [`RouterError::DuplicateBackend`].
    pub fn register_backend(&self, descriptor: BackendDescriptor) -> Result<(), RouterError> {
        self.catalog.register(descriptor)
    }

    /// Stop offering a backend to the selector.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendNotFound`] for an unknown backend.
    pub fn disable_backend(&self, backend: &str) -> Result<(), RouterError> {
        self.catalog.disable(backend)
    }

    /// Offer a disabled backend to the selector again.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendNotFound`] for an unknown backend.
    pub fn enable_backend(&self, backend: &str) -> Result<(), RouterError> {
        self.catalog.enable(backend)
    }

    /// Windowed statistics for one backend and task.
    pub fn stats(&self, backend: &str, task: TaskKind) -> Option<PerformanceStats> {
        self.learning.stats(backend, task)
    }

    /// Subscribe to the live outcome feed.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<OutcomeRecord> {
        self.learning.subscribe()
    }

    /// The `n` most recent outcomes, newest last.
    pub fn recent_outcomes(&self, n: usize) -> Vec<OutcomeRecord> {
        self.learning.recent(n)
    }

    /// Circuit snapshots for every backend that has a breaker.
    pub async fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.router.breakers().snapshots().await
    }

    /// Plan a request without executing it.
    ///
    /// # Errors
    ///
    /// Same as [`Selector::plan`].
    pub fn plan(&self, ctx: &RequestContext) -> Result<OptimizationPlan, RouterError> {
        self.selector.plan(ctx)
    }

    /// Shared catalog.
    pub fn catalog(&self) -> &Arc<BackendCatalog> {
        &self.catalog
    }

    fn known(&self, backend: &str) -> Result<(), RouterError> {
        match self.catalog.get(backend) {
            Some(_) => Ok(()),
            None => Err(RouterError::BackendNotFound(backend.to_string())),
        }
    }
}

/// Trim the prompt and reject it if nothing is left.
fn sanitize(prompt: &str) -> Result<String, RouterError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(RouterError::InvalidRequest("prompt must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

fn from_cache(entry: CacheEntry, start: Instant) -> RoutedResponse {
    RoutedResponse {
        content: entry.content,
        backend_used: entry.backend,
        actual_cost: 0.0,
        latency: start.elapsed(),
        quality_estimate: entry.quality,
        cached: true,
        backends_attempted: Vec::new(),
        fallbacks_used: 0,
        usage: TokenUsage::default(),
    }
}

fn as_shared(response: RoutedResponse, start: Instant) -> RoutedResponse {
    RoutedResponse {
        actual_cost: 0.0,
        latency: start.elapsed(),
        cached: true,
        backends_attempted: Vec::new(),
        fallbacks_used: 0,
        usage: TokenUsage::default(),
        ..response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;
    use crate::cache::CacheConfig;

    fn orchestrator(coalesce: bool) -> RequestOrchestrator {
        let mut config = RouterConfig::default();
        config.cache = CacheConfig {
            min_quality: 0.0,
            ..CacheConfig::default()
        };
        config.orchestrator.coalesce_in_flight = coalesce;
        config.backends = vec![
            BackendDescriptor::new("cheap", "echo", 0.000_001, 200, 0.7).with_capability(TaskKind::General, 0.7),
            BackendDescriptor::new("premium", "echo", 0.000_02, 800, 0.95).with_capability(TaskKind::General, 0.9),
        ];
        let providers = ProviderRegistry::new();
        providers.register("echo", Arc::new(EchoBackend::with_delay(Duration::from_millis(20))));
        RequestOrchestrator::new(&config, providers)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: build orchestrator: {e}")))
    }

    fn request(prompt: &str) -> RouteRequest {
        RouteRequest::new(prompt, RequestContext::new(TaskKind::Chat))
    }

    // -- process -----------------------------------------------------------

    #[tokio::test]
    async fn test_second_identical_request_is_cached() {
        let o = orchestrator(true);
        let first = o.process(request("What is Rust?")).await.unwrap();
        assert!(!first.cached);
        assert!(first.actual_cost > 0.0);

        let second = o.process(request("what   is rust?")).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.actual_cost, 0.0);
        assert_eq!(second.backend_used, first.backend_used);
        assert!(second.backends_attempted.is_empty());
        assert_eq!(o.recent_outcomes(10).len(), 1, "cache hit must not record an outcome");
    }

    #[tokio::test]
    async fn test_clear_cache_forces_execution() {
        let o = orchestrator(true);
        o.process(request("hello")).await.unwrap();
        o.clear_cache();
        let again = o.process(request("hello")).await.unwrap();
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let o = orchestrator(true);
        let err = o.process(request("   \n ")).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_invalid_constraints_rejected_before_planning() {
        let o = orchestrator(true);
        let req = RouteRequest::new("x", RequestContext::new(TaskKind::Chat).with_min_quality(2.0));
        assert!(matches!(o.process(req).await, Err(RouterError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_execute_once() {
        let o = orchestrator(true);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let o = o.clone();
            handles.push(tokio::spawn(async move { o.process(request("same prompt")).await }));
        }
        let mut fresh = 0;
        for h in handles {
            let resp = h.await.unwrap().unwrap();
            if !resp.cached {
                fresh += 1;
            } else {
                assert_eq!(resp.actual_cost, 0.0);
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(o.recent_outcomes(10).len(), 1);
    }

    // -- batching ----------------------------------------------------------

    #[tokio::test]
    async fn test_batch_returns_results_in_input_order() {
        let o = orchestrator(false);
        let prompts = ["one", "two", "three", "four"];
        let results = o
            .process_batch(prompts.iter().map(|p| request(p)).collect())
            .await;
        assert_eq!(results.len(), 4);
        for (prompt, result) in prompts.iter().zip(results) {
            let resp = result.unwrap();
            assert!(resp.content.ends_with(prompt), "got {}", resp.content);
        }
    }

    #[tokio::test]
    async fn test_batch_group_shares_planning_error() {
        let o = orchestrator(false);
        let impossible = RequestContext::new(TaskKind::Chat).with_min_quality(0.99);
        let results = o
            .process_batch(vec![
                RouteRequest::new("a", impossible.clone()),
                request("b"),
                RouteRequest::new("c", impossible),
            ])
            .await;
        assert!(matches!(results[0], Err(RouterError::NoCandidate { .. })));
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(RouterError::NoCandidate { .. })));
    }

    // -- admin -------------------------------------------------------------

    #[tokio::test]
    async fn test_reset_unknown_circuit_is_not_found() {
        let o = orchestrator(true);
        assert_eq!(
            o.reset_circuit("ghost").await,
            Err(RouterError::BackendNotFound("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_trip_and_reset_reflected_in_listing() {
        let o = orchestrator(true);
        o.trip_circuit("cheap").await.unwrap();
        let views = o.list_backends().await;
        let cheap = views.iter().find(|v| v.name == "cheap").unwrap();
        assert_eq!(cheap.circuit, CircuitStatus::Open);

        o.reset_circuit("cheap").await.unwrap();
        let views = o.list_backends().await;
        let cheap = views.iter().find(|v| v.name == "cheap").unwrap();
        assert_eq!(cheap.circuit, CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_disabled_backend_is_not_chosen() {
        let o = orchestrator(false);
        o.disable_backend("cheap").unwrap();
        let resp = o.process(request("pick something")).await.unwrap();
        assert_eq!(resp.backend_used, "premium");
        assert!(o.list_backends().await.iter().any(|v| v.name == "cheap" && !v.enabled));
    }

    #[tokio::test]
    async fn test_outcome_feed_receives_records() {
        let o = orchestrator(true);
        let mut feed = o.subscribe_outcomes();
        let resp = o.process(request("feed me")).await.unwrap();
        let record = feed.recv().await.unwrap();
        assert_eq!(record.backend, resp.backend_used);
        assert!(record.success);
        assert!(o.stats(&resp.backend_used, TaskKind::Chat).is_some());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RouterConfig::default();
        config.resilience.call_timeout_ms = 0;
        let err = RequestOrchestrator::new(&config, ProviderRegistry::new()).unwrap_err();
        assert!(matches!(err, RouterError::ConfigError(_)));
    }
}
