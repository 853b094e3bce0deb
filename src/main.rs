//! Demo binary for tokio-backend-router
//!
//! Registers a small catalog of echo-backed backends, routes a mix of
//! requests (including repeats and a batch) and prints the metrics summary.
//!
//! ## Environment Variables
//!
//! - `ROUTER_CONFIG=path/to/router.toml`: load configuration from a file
//! - `OPENAI_API_KEY`: additionally register the `openai` provider
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_backend_router::config::{loader, RouterConfig};
use tokio_backend_router::{
    init_tracing, metrics, BackendDescriptor, EchoBackend, OpenAiCompatibleBackend, Priority,
    ProviderRegistry, RequestContext, RequestOrchestrator, RouteRequest, TaskKind,
};
use tracing::{info, warn};

fn demo_backends() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor::new("echo-mini", "echo", 0.000_000_5, 250, 0.72)
            .with_max_context(16_000)
            .with_capability(TaskKind::General, 0.65)
            .with_capability(TaskKind::Chat, 0.75),
        BackendDescriptor::new("echo-standard", "echo", 0.000_003, 700, 0.84)
            .with_pricing(0.000_003, 0.000_006)
            .with_capability(TaskKind::General, 0.8),
        BackendDescriptor::new("echo-coder", "echo", 0.000_008, 1_200, 0.9)
            .with_capability(TaskKind::Code, 0.95)
            .with_capability(TaskKind::Analysis, 0.85),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match std::env::var("ROUTER_CONFIG") {
        Ok(path) => {
            info!(path = %path, "loading router configuration");
            loader::load_from_file(Path::new(&path))?
        }
        Err(_) => RouterConfig {
            backends: demo_backends(),
            ..RouterConfig::default()
        },
    };

    let providers = ProviderRegistry::new();
    providers.register("echo", Arc::new(EchoBackend::with_delay(Duration::from_millis(15))));
    match OpenAiCompatibleBackend::from_env() {
        Ok(openai) => providers.register("openai", Arc::new(openai)),
        Err(e) => info!(reason = %e, "openai provider not registered"),
    }

    let router = RequestOrchestrator::new(&config, providers)?;
    info!(backends = router.catalog().len(), "router ready");

    let demo = [
        (TaskKind::Chat, Priority::Low, "What is the capital of France?"),
        (TaskKind::Code, Priority::Critical, "Write a binary search in Rust"),
        (TaskKind::Analysis, Priority::Normal, "Compare TCP and QUIC congestion control"),
        (TaskKind::Chat, Priority::Low, "what is the capital of   France?"),
        (TaskKind::Summarization, Priority::High, "Summarize the water cycle"),
    ];

    for (task, priority, prompt) in demo {
        let ctx = RequestContext::new(task)
            .with_priority(priority)
            .with_caller("demo-client");
        match router.process(RouteRequest::new(prompt, ctx)).await {
            Ok(resp) => info!(
                backend = %resp.backend_used,
                cached = resp.cached,
                cost = resp.actual_cost,
                latency_ms = resp.latency.as_millis() as u64,
                quality = resp.quality_estimate,
                "routed"
            ),
            Err(e) => warn!(error = %e, "request failed"),
        }
    }

    let batch: Vec<RouteRequest> = (0..6)
        .map(|i| RouteRequest::new(format!("Translate greeting #{i} to French"), RequestContext::new(TaskKind::Translation)))
        .collect();
    let results = router.process_batch(batch).await;
    let ok = results.iter().filter(|r| r.is_ok()).count();
    info!(ok, total = results.len(), "batch complete");

    for view in router.list_backends().await {
        info!(
            backend = %view.name,
            quality = view.quality,
            enabled = view.enabled,
            circuit = %view.circuit,
            "backend status"
        );
    }

    let summary = metrics::get_metrics_summary();
    info!(requests = ?summary.requests_total, cache = ?summary.cache_events, "demo complete");

    Ok(())
}
