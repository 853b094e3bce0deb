//! Prometheus metrics for the backend router.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `record_backend_call`, …) are no-ops if `init_metrics` was
//! never called, so routing is always safe to run and observability simply
//! degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_requests_total` | Counter | `task`, `outcome` |
//! | `router_backend_calls_total` | Counter | `backend`, `result` |
//! | `router_backend_call_duration_seconds` | Histogram | `backend` |
//! | `router_cost_usd_total` | Counter | `backend` |
//! | `router_fallbacks_total` | Counter | `task` |
//! | `router_skips_total` | Counter | `backend`, `reason` |
//! | `router_cache_events_total` | Counter | `event` |
//! | `router_circuit_state` | Gauge | `backend` |

use crate::RouterError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the router, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Routed requests by task kind and terminal outcome.
    pub requests_total: CounterVec,
    /// Individual backend calls by result (`success`, `error`, `timeout`).
    pub backend_calls: CounterVec,
    /// Backend call latency.
    pub backend_duration: HistogramVec,
    /// Spend per backend in USD.
    pub cost_total: CounterVec,
    /// Requests served by a fallback rather than the primary.
    pub fallbacks_total: CounterVec,
    /// Backends skipped without an attempt, by reason.
    pub skips_total: CounterVec,
    /// Response cache events (`hit`, `miss`, `store`, `evict`, `expired`, `coalesced`).
    pub cache_events: CounterVec,
    /// Breaker state per backend: 0 closed, 1 half-open, 2 open.
    pub circuit_state: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_err(e: prometheus::Error) -> RouterError {
    RouterError::Other(format!("metrics init failed: {e}"))
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C, RouterError> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| RouterError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

impl Metrics {
    /// Build a metrics bundle whose metric names start with `prefix`.
    fn build(prefix: &str) -> Result<Self, RouterError> {
        let registry = Registry::new();
        let name = |suffix: &str| format!("{prefix}_{suffix}");

        let requests_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("requests_total"), "Routed requests by task and outcome"),
                &["task", "outcome"],
            )
            .map_err(build_err)?,
        )?;
        let backend_calls = register(
            &registry,
            CounterVec::new(
                Opts::new(name("backend_calls_total"), "Individual backend calls by result"),
                &["backend", "result"],
            )
            .map_err(build_err)?,
        )?;
        let backend_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(name("backend_call_duration_seconds"), "Backend call latency"),
                &["backend"],
            )
            .map_err(build_err)?,
        )?;
        let cost_total = register(
            &registry,
            CounterVec::new(Opts::new(name("cost_usd_total"), "Spend per backend in USD"), &["backend"])
                .map_err(build_err)?,
        )?;
        let fallbacks_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("fallbacks_total"), "Requests served by a fallback backend"),
                &["task"],
            )
            .map_err(build_err)?,
        )?;
        let skips_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("skips_total"), "Backends skipped without an attempt"),
                &["backend", "reason"],
            )
            .map_err(build_err)?,
        )?;
        let cache_events = register(
            &registry,
            CounterVec::new(Opts::new(name("cache_events_total"), "Response cache events"), &["event"])
                .map_err(build_err)?,
        )?;
        let circuit_state = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(name("circuit_state"), "Breaker state: 0 closed, 1 half-open, 2 open"),
                &["backend"],
            )
            .map_err(build_err)?,
        )?;

        Ok(Self {
            registry,
            requests_total,
            backend_calls,
            backend_duration,
            cost_total,
            fallbacks_total,
            skips_total,
            cache_events,
            circuit_state,
        })
    }
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if metric construction or registry
/// registration fails.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::build("router")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a routed request by task kind and outcome label.
///
/// No-op if metrics have not been initialised.
pub fn inc_request(task: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[task, outcome]) {
            c.inc();
        }
    }
}

/// Record one individual backend call and its latency.
///
/// No-op if metrics have not been initialised.
pub fn record_backend_call(backend: &str, result: &str, latency: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.backend_calls.get_metric_with_label_values(&[backend, result]) {
            c.inc();
        }
        if let Ok(h) = m.backend_duration.get_metric_with_label_values(&[backend]) {
            h.observe(latency.as_secs_f64());
        }
    }
}

/// Add spend for a backend.
///
/// Negative or non-finite amounts are ignored.
pub fn add_cost(backend: &str, usd: f64) {
    if !(usd.is_finite() && usd > 0.0) {
        return;
    }
    if let Some(m) = metrics() {
        if let Ok(c) = m.cost_total.get_metric_with_label_values(&[backend]) {
            c.inc_by(usd);
        }
    }
}

/// Count a request that was served by a fallback.
pub fn inc_fallback(task: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.fallbacks_total.get_metric_with_label_values(&[task]) {
            c.inc();
        }
    }
}

/// Count a backend skipped without an attempt.
pub fn inc_skip(backend: &str, reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.skips_total.get_metric_with_label_values(&[backend, reason]) {
            c.inc();
        }
    }
}

/// Count a response cache event.
pub fn inc_cache_event(event: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_events.get_metric_with_label_values(&[event]) {
            c.inc();
        }
    }
}

/// Publish a breaker state code for a backend.
pub fn set_circuit_state(backend: &str, code: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.circuit_state.get_metric_with_label_values(&[backend]) {
            g.set(code);
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of the main counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Request counts keyed by `"task:outcome"`.
    pub requests_total: HashMap<String, u64>,
    /// Backend call counts keyed by `"backend:result"`.
    pub backend_calls: HashMap<String, u64>,
    /// Cache event counts keyed by event label.
    pub cache_events: HashMap<String, u64>,
}

fn label<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> &'a str {
    metric
        .get_label()
        .iter()
        .find(|l| l.get_name() == name)
        .map_or("unknown", |l| l.get_value())
}

fn collect_counter(vec: &CounterVec, labels: &[&str]) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = labels
                .iter()
                .map(|name| label(metric, name))
                .collect::<Vec<_>>()
                .join(":");
            out.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        requests_total: collect_counter(&m.requests_total, &["task", "outcome"]),
        backend_calls: collect_counter(&m.backend_calls, &["backend", "result"]),
        cache_events: collect_counter(&m.cache_events, &["event"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok(), "second call must be a no-op returning Ok");
    }

    #[test]
    fn test_helpers_before_init_do_not_panic() {
        record_backend_call("pre-init", "success", Duration::from_millis(5));
        inc_cache_event("hit");
        add_cost("pre-init", 0.1);
    }

    #[test]
    fn test_isolated_bundle_counts_backend_calls() {
        let m = Metrics::build("t1").unwrap();
        let c = m.backend_calls.get_metric_with_label_values(&["a", "error"]).unwrap();
        c.inc();
        c.inc();
        let summary = collect_counter(&m.backend_calls, &["backend", "result"]);
        assert_eq!(summary.get("a:error"), Some(&2));
    }

    #[test]
    fn test_isolated_bundle_histogram_records_observation() {
        let m = Metrics::build("t2").unwrap();
        m.backend_duration
            .get_metric_with_label_values(&["a"])
            .unwrap()
            .observe(0.005);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "t2_backend_call_duration_seconds")
            .unwrap();
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
    }

    #[test]
    fn test_isolated_bundle_circuit_gauge() {
        let m = Metrics::build("t3").unwrap();
        m.circuit_state.get_metric_with_label_values(&["a"]).unwrap().set(2);
        let families = m.registry.gather();
        let family = families.iter().find(|f| f.get_name() == "t3_circuit_state").unwrap();
        assert!((family.get_metric()[0].get_gauge().get_value() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_gather_after_observation_is_non_empty() {
        let _ = init_metrics();
        inc_request("chat", "success");
        assert!(!gather().is_empty());
        assert!(gather_metrics().contains("router_requests_total"));
    }

    #[test]
    fn test_summary_keys_are_joined_labels() {
        let _ = init_metrics();
        inc_request("code", "no_candidate");
        let summary = get_metrics_summary();
        assert!(summary.requests_total.get("code:no_candidate").copied().unwrap_or(0) >= 1);
    }

    #[test]
    fn test_add_cost_ignores_negative() {
        let _ = init_metrics();
        add_cost("neg", -1.0);
        add_cost("neg", f64::NAN);
    }
}
