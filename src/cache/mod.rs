//! # Stage: Response Cache
//!
//! ## Responsibility
//! Reuse earlier responses for equivalent requests: a TTL-bounded,
//! size-bounded in-memory map keyed by a normalized request fingerprint,
//! plus in-flight coalescing of identical concurrent requests.
//!
//! ## Guarantees
//! - Bounded: never more than `max_entries` entries; inserting into a full
//!   cache evicts the single oldest entry by creation time.
//! - Fresh: expired entries are never returned (lazy expiry at lookup).
//! - Selective: only responses at or above `min_quality` are stored.
//! - Non-blocking lookups: reads go through the sharded map only; the
//!   insert path alone takes a short guard.
//!
//! ## NOT Responsible For
//! - Persistence across restarts
//! - Semantic (embedding) similarity between prompts

pub mod inflight;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::metrics;
use crate::request::RequestContext;

pub use inflight::{Flight, FlightGuard, FlightResult, InFlight};

fn default_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    1_000
}

fn default_ttl_secs() -> u64 {
    3_600
}

fn default_min_quality() -> f64 {
    0.7
}

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CacheConfig {
    /// Whether responses are cached at all. Default: `true`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum entries held. Default: `1000`.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entry lifetime in seconds. Default: one hour.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Minimum observed quality for a response to be stored. Default: `0.7`.
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
            min_quality: default_min_quality(),
        }
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Response content.
    pub content: String,
    /// Backend that produced it.
    pub backend: String,
    /// Cost paid when it was produced.
    pub cost: f64,
    /// Observed quality.
    pub quality: f64,
    /// When it was stored.
    pub created_at: Instant,
    /// Times it has been reused.
    pub hits: u64,
}

impl CacheEntry {
    /// New entry created now with zero hits.
    pub fn new(content: impl Into<String>, backend: impl Into<String>, cost: f64, quality: f64) -> Self {
        Self {
            content: content.into(),
            backend: backend.into(),
            cost,
            quality,
            created_at: Instant::now(),
            hits: 0,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held (expired ones included until looked up).
    pub entries: usize,
    /// Capacity.
    pub capacity: usize,
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
}

/// Size- and TTL-bounded response cache.
///
/// Clone is cheap and all clones share state.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: Arc<DashMap<String, CacheEntry>>,
    insert_guard: Arc<Mutex<()>>,
    config: CacheConfig,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl ResponseCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            insert_guard: Arc::new(Mutex::new(())),
            config,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.max_entries > 0
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Fetch a live entry and count the hit.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        if !self.is_enabled() {
            return None;
        }
        let ttl = self.ttl();
        let expired = match self.store.get_mut(key) {
            Some(mut entry) if entry.created_at.elapsed() < ttl => {
                entry.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("hit");
                debug!(key, hits = entry.hits, "cache hit");
                return Some(entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.store.remove_if(key, |_, e| e.created_at.elapsed() >= ttl);
            metrics::inc_cache_event("expired");
            debug!(key, "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("miss");
        None
    }

    /// Store an entry if its quality meets the threshold.
    ///
    /// Returns `true` when stored. Inserting a new key into a full cache
    /// first evicts the oldest entry.
    pub fn store(&self, key: impl Into<String>, entry: CacheEntry) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if !(entry.quality >= self.config.min_quality) {
            debug!(quality = entry.quality, min = self.config.min_quality, "response below cache threshold");
            return false;
        }
        let key = key.into();

        let Ok(_guard) = self.insert_guard.lock() else {
            return false;
        };
        if !self.store.contains_key(&key) && self.store.len() >= self.config.max_entries {
            // Collect first so no shard guard is held during remove.
            let oldest = self
                .store
                .iter()
                .min_by_key(|e| e.value().created_at)
                .map(|e| e.key().clone());
            if let Some(victim) = oldest {
                self.store.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("evict");
                debug!(key = %victim, "cache evicted oldest entry");
            }
        }
        self.store.insert(key.clone(), entry);
        metrics::inc_cache_event("store");
        debug!(key = %key, "response cached");
        true
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.store.clear();
        debug!("response cache cleared");
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len(),
            capacity: self.config.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Return `true` if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Cache key for a request.
///
/// With an explicit `cache_key` the key is `key:<hash>` of (key, task).
/// Otherwise it is `route:<hash>` of the whitespace-collapsed, lower-cased
/// prompt with the task, complexity and quality floor (two decimals), so
/// requests that differ only in spacing or case share a key while requests
/// with different constraints never do.
pub fn fingerprint(prompt: &str, ctx: &RequestContext) -> String {
    let mut hasher = DefaultHasher::new();
    match &ctx.cache_key {
        Some(key) => {
            key.hash(&mut hasher);
            ctx.task.as_str().hash(&mut hasher);
            format!("key:{:x}", hasher.finish())
        }
        None => {
            let normalized = prompt
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            normalized.hash(&mut hasher);
            ctx.task.as_str().hash(&mut hasher);
            ctx.complexity.as_str().hash(&mut hasher);
            format!("{:.2}", ctx.min_quality).hash(&mut hasher);
            format!("route:{:x}", hasher.finish())
        }
    }
}
