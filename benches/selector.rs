//! Routing hot-path benchmarks.
//!
//! - Selector plan over catalogs of increasing size
//! - Cache fingerprint and lookup
//! - Circuit breaker check (closed)
//! - End-to-end cache hit through the orchestrator

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_backend_router::cache::{CacheConfig, CacheEntry, ResponseCache};
use tokio_backend_router::config::RouterConfig;
use tokio_backend_router::learning::{LearningConfig, LearningStore};
use tokio_backend_router::resilience::{BreakerConfig, CircuitBreakers};
use tokio_backend_router::{
    fingerprint, BackendCatalog, BackendDescriptor, EchoBackend, Priority, ProviderRegistry,
    RequestContext, RequestOrchestrator, RouteRequest, Selector, SelectorConfig, TaskKind,
};

const TASKS: [TaskKind; 4] = [TaskKind::Chat, TaskKind::Code, TaskKind::Analysis, TaskKind::General];

fn catalog(size: usize) -> Arc<BackendCatalog> {
    let catalog = Arc::new(BackendCatalog::new());
    for i in 0..size {
        let quality = 0.5 + (i % 50) as f64 / 100.0;
        let descriptor = BackendDescriptor::new(
            format!("backend-{i}"),
            "echo",
            0.000_001 * (1 + i % 20) as f64,
            200 + (i as u64 % 10) * 150,
            quality,
        )
        .with_capability(TASKS[i % TASKS.len()], quality);
        catalog.register(descriptor).expect("register");
    }
    catalog
}

// ═══════════════════════════════════════════════════════════════════════════
// Selector
// ═══════════════════════════════════════════════════════════════════════════

fn bench_selector_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector_plan");
    for size in [4usize, 16, 64, 256] {
        let catalog = catalog(size);
        let learning = LearningStore::new(Arc::clone(&catalog), &LearningConfig::default());
        let selector = Selector::new(catalog, learning, SelectorConfig::default());
        let ctx = RequestContext::new(TaskKind::Chat).with_priority(Priority::Critical);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(selector.plan(black_box(&ctx)).ok()))
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════

fn bench_fingerprint(c: &mut Criterion) {
    let ctx = RequestContext::new(TaskKind::Summarization);
    let prompt = "Summarize   the following\n\tparagraph about the water cycle. ".repeat(20);
    c.bench_function("fingerprint", |b| {
        b.iter(|| black_box(fingerprint(black_box(&prompt), &ctx)))
    });
}

fn bench_cache_lookup_hit(c: &mut Criterion) {
    let cache = ResponseCache::new(CacheConfig::default());
    for i in 0..1_000 {
        cache.store(format!("route:{i:x}"), CacheEntry::new("content", "a", 0.01, 0.9));
    }
    c.bench_function("cache_lookup_hit", |b| {
        b.iter(|| black_box(cache.lookup(black_box("route:1f4"))))
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Breaker
// ═══════════════════════════════════════════════════════════════════════════

fn bench_breaker_check_closed(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let breakers = CircuitBreakers::new(BreakerConfig::default());
    c.bench_function("breaker_check_closed", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(breakers.check(black_box("backend-1")).await.is_ok());
        })
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

fn bench_orchestrator_cache_hit(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut config = RouterConfig::default();
    config.cache.min_quality = 0.0;
    config.backends = vec![
        BackendDescriptor::new("small", "echo", 0.000_001, 200, 0.8).with_capability(TaskKind::General, 0.8),
    ];
    let providers = ProviderRegistry::new();
    providers.register("echo", Arc::new(EchoBackend::new()));
    let router = RequestOrchestrator::new(&config, providers).expect("router");

    let ctx = RequestContext::new(TaskKind::Chat);
    rt.block_on(router.process(RouteRequest::new("warm", ctx.clone())))
        .expect("warm-up");

    c.bench_function("orchestrator_cache_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let resp = router.process(RouteRequest::new("warm", ctx.clone())).await;
            black_box(resp.map(|r| r.cached).ok());
        })
    });
}

criterion_group!(
    benches,
    bench_selector_plan,
    bench_fingerprint,
    bench_cache_lookup_hit,
    bench_breaker_check_closed,
    bench_orchestrator_cache_hit,
);
criterion_main!(benches);
