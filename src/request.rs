//! Request-side types: task kinds, complexity tiers, priorities, the
//! per-request constraint set and the outbound routed response.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::backend::TokenUsage;

/// Kind of work a request asks for. Backends declare a performance rating
/// per kind; [`TaskKind::General`] is accepted as a stand-in for any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Conversational replies.
    Chat,
    /// Code generation or review.
    Code,
    /// Structured analysis and reasoning.
    Analysis,
    /// Creative writing.
    Creative,
    /// Condensing long input.
    Summarization,
    /// Translation between languages.
    Translation,
    /// Generic capability, accepted for every task kind.
    General,
}

impl TaskKind {
    /// Stable lowercase label, used for metrics and fingerprints.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Analysis => "analysis",
            Self::Creative => "creative",
            Self::Summarization => "summarization",
            Self::Translation => "translation",
            Self::General => "general",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse complexity tier, used as a proxy for expected token volume.
///
/// | Tier     | Input tokens | Output tokens | Latency multiplier |
/// |----------|--------------|---------------|--------------------|
/// | `low`    | 400          | 200           | 1.0                |
/// | `medium` | 1 000        | 500           | 1.5                |
/// | `high`   | 3 000        | 1 500         | 2.5                |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Short prompts, short answers.
    Low,
    /// Typical request.
    #[default]
    Medium,
    /// Long context or long generation.
    High,
}

impl Complexity {
    /// Nominal `(input, output)` token volume for this tier.
    pub fn token_volume(&self) -> (u64, u64) {
        match self {
            Self::Low => (400, 200),
            Self::Medium => (1_000, 500),
            Self::High => (3_000, 1_500),
        }
    }

    /// Total nominal tokens (input + output).
    pub fn total_tokens(&self) -> u64 {
        let (input, output) = self.token_volume();
        input + output
    }

    /// Factor applied to a backend's nominal latency.
    pub fn latency_multiplier(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 1.5,
            Self::High => 2.5,
        }
    }

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier. `Critical` favours quality, `Low` favours cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Cheapest acceptable answer.
    Low,
    /// Default blend.
    #[default]
    Normal,
    /// Same blend as normal; kept distinct for callers and batching.
    High,
    /// Best acceptable answer.
    Critical,
}

impl Priority {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A caller's constraints for one request.
///
/// Built with [`RequestContext::new`] and the `with_*` methods; immutable
/// once handed to the router.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tokio_backend_router::{Complexity, Priority, RequestContext, TaskKind};
///
/// let ctx = RequestContext::new(TaskKind::Code)
///     .with_complexity(Complexity::High)
///     .with_max_cost(0.05)
///     .with_max_latency(Duration::from_secs(20))
///     .with_min_quality(0.8)
///     .with_priority(Priority::Critical);
/// assert_eq!(ctx.task, TaskKind::Code);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Requested task kind.
    pub task: TaskKind,
    /// Complexity tier.
    pub complexity: Complexity,
    /// Maximum acceptable estimated cost in USD.
    pub max_cost: f64,
    /// Maximum acceptable latency; also the request's overall deadline.
    pub max_latency: Duration,
    /// Minimum acceptable static quality score.
    pub min_quality: f64,
    /// Priority tier.
    pub priority: Priority,
    /// Optional caller identity, carried into logs.
    pub caller_id: Option<String>,
    /// Optional explicit cache key, replacing the prompt fingerprint.
    pub cache_key: Option<String>,
}

impl RequestContext {
    /// Create a context for `task` with permissive defaults:
    /// medium complexity, $1.00 ceiling, 30s latency, no quality floor,
    /// normal priority.
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            complexity: Complexity::Medium,
            max_cost: 1.0,
            max_latency: Duration::from_secs(30),
            min_quality: 0.0,
            priority: Priority::Normal,
            caller_id: None,
            cache_key: None,
        }
    }

    /// Set the complexity tier.
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set the cost ceiling in USD.
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = max_cost;
        self
    }

    /// Set the latency ceiling.
    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// Set the quality floor.
    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a caller identity.
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Use an explicit cache key instead of the prompt fingerprint.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Check that every constraint is in range.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if !self.max_cost.is_finite() || self.max_cost < 0.0 {
            return Err(format!("max_cost must be a finite value >= 0, got {}", self.max_cost));
        }
        if self.max_latency.is_zero() {
            return Err("max_latency must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_quality) {
            return Err(format!("min_quality must be in [0.0, 1.0], got {}", self.min_quality));
        }
        Ok(())
    }
}

/// The inbound request: a prompt plus its constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    /// Correlation id, generated when not supplied.
    pub request_id: String,
    /// Prompt text sent to the backend.
    pub prompt: String,
    /// Constraints for backend selection.
    pub context: RequestContext,
}

impl RouteRequest {
    /// Create a request with a fresh v4 UUID as its id.
    pub fn new(prompt: impl Into<String>, context: RequestContext) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            context,
        }
    }

    /// Override the generated request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Result of a routed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResponse {
    /// Generated content.
    pub content: String,
    /// Backend that produced the content (the original one for cache hits).
    pub backend_used: String,
    /// Cost paid by this request in USD; zero for cache hits.
    pub actual_cost: f64,
    /// Wall-clock latency observed by this request.
    pub latency: Duration,
    /// Observed or recorded quality in `[0.0, 1.0]`.
    pub quality_estimate: f64,
    /// Whether the response was served without calling a backend.
    pub cached: bool,
    /// Backends attempted, in chain order. Empty for cache hits.
    pub backends_attempted: Vec<String>,
    /// Position of `backend_used` in the plan's chain (0 = primary).
    pub fallbacks_used: usize,
    /// Token usage reported by the backend; zero for cache hits.
    pub usage: TokenUsage,
}
