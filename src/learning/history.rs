//! Bounded outcome history and on-demand performance statistics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::request::TaskKind;

/// Outcome of one backend attempt (after its retries) within a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Routed request the attempt belonged to.
    pub request_id: String,
    /// Backend that was attempted.
    pub backend: String,
    /// Task kind of the request.
    pub task: TaskKind,
    /// Cost paid in USD (zero for failed attempts).
    pub cost: f64,
    /// Attempt latency in milliseconds, including retries.
    pub latency_ms: u64,
    /// Whether the attempt produced a response.
    pub success: bool,
    /// Observed quality in `[0.0, 1.0]`; zero for failures.
    pub quality: f64,
    /// Last error message for failed attempts.
    pub error: Option<String>,
}

impl OutcomeRecord {
    /// Record for a successful attempt.
    pub fn success(
        request_id: impl Into<String>,
        backend: impl Into<String>,
        task: TaskKind,
        cost: f64,
        latency: Duration,
        quality: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            backend: backend.into(),
            task,
            cost,
            latency_ms: latency.as_millis() as u64,
            success: true,
            quality: quality.clamp(0.0, 1.0),
            error: None,
        }
    }

    /// Record for a failed attempt.
    pub fn failure(
        request_id: impl Into<String>,
        backend: impl Into<String>,
        task: TaskKind,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            backend: backend.into(),
            task,
            cost: 0.0,
            latency_ms: latency.as_millis() as u64,
            success: false,
            quality: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Recent performance of one backend on one task kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    /// Number of records the statistics cover.
    pub samples: usize,
    /// Fraction of successful attempts.
    pub success_rate: f64,
    /// Mean observed quality (failures count as zero).
    pub mean_quality: f64,
    /// Mean cost in USD of successful attempts; zero when none succeeded.
    pub mean_cost: f64,
    /// Mean latency in milliseconds.
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    quality: f64,
    cost: f64,
    latency_ms: u64,
}

/// Bounded ring of outcome records plus per-(backend, task) windows.
///
/// The ring serves the queryable feed; statistics come from the windows so
/// a busy backend cannot push a quiet one's samples out of view.
#[derive(Debug)]
pub struct OutcomeHistory {
    ring: Mutex<VecDeque<OutcomeRecord>>,
    capacity: usize,
    windows: DashMap<(String, TaskKind), VecDeque<Sample>>,
    window: usize,
}

impl OutcomeHistory {
    /// Create a history holding at most `capacity` records and computing
    /// statistics over the last `window` records per (backend, task).
    pub fn new(capacity: usize, window: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            windows: DashMap::new(),
            window,
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&self, record: OutcomeRecord) {
        let sample = Sample {
            success: record.success,
            quality: record.quality,
            cost: record.cost,
            latency_ms: record.latency_ms,
        };
        {
            let mut window = self
                .windows
                .entry((record.backend.clone(), record.task))
                .or_default();
            window.push_back(sample);
            while window.len() > self.window {
                window.pop_front();
            }
        }

        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(record);
            while ring.len() > self.capacity {
                ring.pop_front();
            }
        }
    }

    /// Most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<OutcomeRecord> {
        let ring = match self.ring.lock() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        let start = ring.len().saturating_sub(n);
        ring.iter().skip(start).cloned().collect()
    }

    /// Every record for `backend` still in the ring, oldest first.
    pub fn for_backend(&self, backend: &str) -> Vec<OutcomeRecord> {
        let ring = match self.ring.lock() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        ring.iter().filter(|r| r.backend == backend).cloned().collect()
    }

    /// Statistics over the recent window for (backend, task); `None` when
    /// there is no history yet.
    pub fn stats(&self, backend: &str, task: TaskKind) -> Option<PerformanceStats> {
        let window = self.windows.get(&(backend.to_string(), task))?;
        if window.is_empty() {
            return None;
        }
        let n = window.len() as f64;
        let successes = window.iter().filter(|s| s.success).count() as f64;
        let quality: f64 = window.iter().map(|s| s.quality).sum();
        let paid: f64 = window.iter().filter(|s| s.success).map(|s| s.cost).sum();
        let latency: f64 = window.iter().map(|s| s.latency_ms as f64).sum();
        Some(PerformanceStats {
            samples: window.len(),
            success_rate: successes / n,
            mean_quality: quality / n,
            mean_cost: if successes > 0.0 { paid / successes } else { 0.0 },
            mean_latency_ms: latency / n,
        })
    }

    /// Number of records in the ring.
    pub fn len(&self) -> usize {
        self.ring.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Return `true` if the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the per-(backend, task) statistics window.
    pub fn window(&self) -> usize {
        self.window
    }
}
