//! Shared fixtures for integration tests: a scripted provider adapter and
//! router builders.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_backend_router::config::RouterConfig;
use tokio_backend_router::{
    Backend, BackendDescriptor, BackendError, BackendRequest, BackendResponse, ProviderRegistry,
    RequestOrchestrator, TaskKind, TokenUsage,
};

/// How one backend behaves.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Calls (0-based) below this index fail.
    pub fail_first: usize,
    /// Every call fails.
    pub fail_always: bool,
    /// Status code used for failures.
    pub status: u16,
    /// Time each call takes.
    pub delay: Duration,
    /// Quality reported with successes.
    pub quality: Option<f64>,
    /// Health-probe verdict.
    pub healthy: bool,
    /// Time each health probe takes.
    pub probe_delay: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            fail_first: 0,
            fail_always: false,
            status: 503,
            delay: Duration::from_millis(2),
            quality: Some(0.9),
            healthy: true,
            probe_delay: Duration::ZERO,
        }
    }
}

impl Behavior {
    pub fn failing() -> Self {
        Self {
            fail_always: true,
            ..Self::default()
        }
    }

    pub fn flaky(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::default()
        }
    }
}

/// Provider adapter driven by per-backend [`Behavior`]s. Backends without
/// a behavior succeed immediately.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, usize>>,
    order: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, backend: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(backend.to_string(), behavior);
    }

    pub fn calls(&self, backend: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).values().sum()
    }

    /// Backends called, in call order (repeats included).
    pub fn call_order(&self) -> Vec<String> {
        self.order.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn behavior(&self, backend: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let started = Instant::now();
        let index = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            let n = calls.entry(request.backend.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.backend.clone());

        let behavior = self.behavior(&request.backend);
        tokio::time::sleep(behavior.delay).await;

        if behavior.fail_always || index < behavior.fail_first {
            return Err(BackendError::Status {
                status: behavior.status,
                body: format!("scripted failure #{index}"),
            });
        }
        Ok(BackendResponse {
            content: format!("{} answered: {}.", request.backend, request.prompt),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            latency: started.elapsed(),
            quality: behavior.quality,
        })
    }

    async fn is_healthy(&self, backend: &str) -> bool {
        let behavior = self.behavior(backend);
        tokio::time::sleep(behavior.probe_delay).await;
        behavior.healthy
    }
}

pub fn descriptor(name: &str, cost_per_token: f64, latency_ms: u64, quality: f64) -> BackendDescriptor {
    BackendDescriptor::new(name, "scripted", cost_per_token, latency_ms, quality)
        .with_capability(TaskKind::General, quality)
}

/// Router config with fast retries and a permissive cache.
pub fn fast_config(backends: Vec<BackendDescriptor>) -> RouterConfig {
    let mut config = RouterConfig::default();
    config.resilience.retry.base_delay_ms = 1;
    config.resilience.retry.max_delay_ms = 5;
    config.resilience.call_timeout_ms = 2_000;
    config.cache.min_quality = 0.0;
    config.backends = backends;
    config
}

pub fn router(config: &RouterConfig, backend: &Arc<ScriptedBackend>) -> RequestOrchestrator {
    let providers = ProviderRegistry::new();
    providers.register("scripted", Arc::clone(backend) as Arc<dyn Backend>);
    RequestOrchestrator::new(config, providers)
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: build router: {e}")))
}
