//! Cost-aware backend selection.
//!
//! [`Selector::plan`] filters the enabled catalog against a request's hard
//! constraints, ranks the survivors and returns an [`OptimizationPlan`]
//! holding the primary backend and its fallback chain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::catalog::{BackendCatalog, BackendDescriptor};
use crate::learning::LearningStore;
use crate::request::RequestContext;
use crate::RouterError;

use super::config::SelectorConfig;
use super::scorer::{self, ScoreBreakdown};

/// Hard constraint a backend failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Declares neither the task nor `general`.
    Capability,
    /// Estimated cost above the ceiling.
    Cost {
        /// Estimated cost in USD.
        estimated: f64,
        /// Request ceiling in USD.
        max: f64,
    },
    /// Scaled latency above the ceiling.
    Latency {
        /// Estimated latency in milliseconds.
        estimated_ms: f64,
        /// Request ceiling in milliseconds.
        max_ms: u64,
    },
    /// Static quality below the floor.
    Quality {
        /// Current quality.
        quality: f64,
        /// Request floor.
        min: f64,
    },
    /// Tier token volume larger than the context window.
    Context {
        /// Tokens required by the complexity tier.
        required: u64,
        /// Backend context window.
        max: u64,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability => f.write_str("task not supported"),
            Self::Cost { estimated, max } => write!(f, "estimated cost ${estimated:.6} exceeds ${max:.6}"),
            Self::Latency { estimated_ms, max_ms } => {
                write!(f, "estimated latency {estimated_ms:.0}ms exceeds {max_ms}ms")
            }
            Self::Quality { quality, min } => write!(f, "quality {quality:.3} below {min:.3}"),
            Self::Context { required, max } => {
                write!(f, "needs {required} tokens, context window is {max}")
            }
        }
    }
}

/// A backend excluded from a plan, with the first constraint it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Backend name.
    pub backend: String,
    /// Failed constraint.
    pub reason: RejectReason,
}

/// Ranked selection result.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationPlan {
    /// Highest-ranked backend.
    pub primary: String,
    /// Next-best backends, best first, never repeating the primary.
    pub fallbacks: Vec<String>,
    /// Primary's estimated cost in USD.
    pub estimated_cost: f64,
    /// Primary's estimated latency.
    pub estimated_latency: Duration,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Human-readable reason for the choice.
    pub justification: String,
    /// Number of enabled backends that were considered.
    pub candidates_considered: usize,
}

impl OptimizationPlan {
    /// Primary followed by fallbacks, in attempt order.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }

    /// Number of backends in the chain.
    pub fn len(&self) -> usize {
        1 + self.fallbacks.len()
    }

    /// Always `false`; a plan has at least a primary.
    pub fn is_empty(&self) -> bool {
        false
    }
}

struct Candidate {
    descriptor: BackendDescriptor,
    breakdown: ScoreBreakdown,
}

/// Stateless ranking over shared catalog and learning state.
#[derive(Debug, Clone)]
pub struct Selector {
    catalog: Arc<BackendCatalog>,
    learning: LearningStore,
    config: SelectorConfig,
}

impl Selector {
    /// Create a selector.
    pub fn new(catalog: Arc<BackendCatalog>, learning: LearningStore, config: SelectorConfig) -> Self {
        Self {
            catalog,
            learning,
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// First hard constraint `descriptor` fails for `ctx`, if any.
    pub fn check(descriptor: &BackendDescriptor, ctx: &RequestContext) -> Option<RejectReason> {
        if descriptor.capability_for(ctx.task).is_none() {
            return Some(RejectReason::Capability);
        }
        let estimated = descriptor.estimate_cost(ctx.complexity);
        if estimated > ctx.max_cost {
            return Some(RejectReason::Cost {
                estimated,
                max: ctx.max_cost,
            });
        }
        let estimated_ms = descriptor.estimate_latency_ms(ctx.complexity);
        let max_ms = ctx.max_latency.as_millis() as u64;
        if estimated_ms > max_ms as f64 {
            return Some(RejectReason::Latency { estimated_ms, max_ms });
        }
        if descriptor.quality < ctx.min_quality {
            return Some(RejectReason::Quality {
                quality: descriptor.quality,
                min: ctx.min_quality,
            });
        }
        let required = ctx.complexity.total_tokens();
        if required > descriptor.max_context_tokens {
            return Some(RejectReason::Context {
                required,
                max: descriptor.max_context_tokens,
            });
        }
        None
    }

    /// Produce a plan for `ctx`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidRequest`] if a constraint is out of range.
    /// - [`RouterError::NoCandidate`] if no enabled backend passes every
    ///   hard constraint; carries every rejection.
    pub fn plan(&self, ctx: &RequestContext) -> Result<OptimizationPlan, RouterError> {
        ctx.validate().map_err(RouterError::InvalidRequest)?;

        let enabled = self.catalog.list_enabled();
        let considered = enabled.len();
        let max_est_cost = enabled
            .iter()
            .map(|d| d.estimate_cost(ctx.complexity))
            .fold(0.0_f64, f64::max);

        let mut rejected = Vec::new();
        let mut candidates = Vec::new();
        for descriptor in enabled {
            if let Some(reason) = Self::check(&descriptor, ctx) {
                debug!(backend = %descriptor.name, %reason, "backend rejected");
                rejected.push(Rejection {
                    backend: descriptor.name,
                    reason,
                });
                continue;
            }
            let stats = self.learning.stats(&descriptor.name, ctx.task);
            let breakdown = scorer::score(&descriptor, ctx, &self.config, max_est_cost, stats.as_ref());
            candidates.push(Candidate { descriptor, breakdown });
        }

        if candidates.is_empty() {
            return Err(RouterError::NoCandidate {
                task: ctx.task,
                rejected,
            });
        }

        // Stable: ties keep registration order.
        candidates.sort_by(|a, b| {
            b.breakdown
                .blended
                .partial_cmp(&a.breakdown.blended)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut ranked = candidates.into_iter();
        let Some(primary) = ranked.next() else {
            return Err(RouterError::NoCandidate {
                task: ctx.task,
                rejected,
            });
        };
        let fallbacks: Vec<String> = ranked
            .take(self.config.max_fallbacks)
            .map(|c| c.descriptor.name)
            .collect();

        let b = &primary.breakdown;
        let confidence = scorer::confidence(b.blended, b.samples, self.learning.window());
        let justification = format!(
            "{} scored {:.3} (quality {:.2}, cost efficiency {:.2}, latency efficiency {:.2}, \
             capability {:.2}, history {:.2} over {} samples); {} of {} backends eligible",
            primary.descriptor.name,
            b.blended,
            b.quality,
            b.cost_efficiency,
            b.latency_efficiency,
            b.capability,
            b.historical,
            b.samples,
            considered - rejected.len(),
            considered,
        );

        let plan = OptimizationPlan {
            estimated_cost: primary.descriptor.estimate_cost(ctx.complexity),
            estimated_latency: Duration::from_millis(
                primary.descriptor.estimate_latency_ms(ctx.complexity).round() as u64,
            ),
            primary: primary.descriptor.name,
            fallbacks,
            confidence,
            justification,
            candidates_considered: considered,
        };
        info!(
            task = %ctx.task,
            primary = %plan.primary,
            fallbacks = ?plan.fallbacks,
            confidence = plan.confidence,
            "plan selected"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::{LearningConfig, OutcomeRecord};
    use crate::request::{Complexity, Priority, TaskKind};

    fn setup(descriptors: Vec<BackendDescriptor>) -> (Selector, LearningStore) {
        let catalog = Arc::new(BackendCatalog::new());
        for d in descriptors {
            catalog.register(d).unwrap();
        }
        let learning = LearningStore::new(Arc::clone(&catalog), &LearningConfig::default());
        (
            Selector::new(catalog, learning.clone(), SelectorConfig::default()),
            learning,
        )
    }

    fn chat(name: &str, cost: f64, latency_ms: u64, quality: f64) -> BackendDescriptor {
        BackendDescriptor::new(name, "echo", cost, latency_ms, quality).with_capability(TaskKind::Chat, 0.8)
    }

    #[test]
    fn test_plan_picks_best_and_orders_fallbacks() {
        let (selector, _) = setup(vec![
            chat("mid", 0.000_01, 800, 0.7),
            chat("best", 0.000_001, 400, 0.9),
            chat("worst", 0.000_1, 4_000, 0.5),
        ]);
        let plan = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap();
        assert_eq!(plan.primary, "best");
        assert_eq!(plan.fallbacks, vec!["mid", "worst"]);
        assert_eq!(plan.candidates_considered, 3);
        assert!(plan.justification.contains("best"));
    }

    #[test]
    fn test_plan_chain_never_repeats() {
        let (selector, _) = setup((0..6).map(|i| chat(&format!("b{i}"), 0.000_001, 500, 0.8)).collect());
        let plan = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap();
        let chain: Vec<&str> = plan.chain().collect();
        let mut unique = chain.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(chain.len(), unique.len());
        assert_eq!(plan.len(), 4, "primary + max_fallbacks");
    }

    #[test]
    fn test_plan_ties_keep_registration_order() {
        let (selector, _) = setup(vec![chat("first", 0.0, 500, 0.8), chat("second", 0.0, 500, 0.8)]);
        let plan = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap();
        assert_eq!(plan.primary, "first");
        assert_eq!(plan.fallbacks, vec!["second"]);
    }

    #[test]
    fn test_plan_rejects_over_budget() {
        let (selector, _) = setup(vec![chat("pricey", 0.01, 500, 0.9)]);
        let ctx = RequestContext::new(TaskKind::Chat).with_max_cost(0.001);
        match selector.plan(&ctx).unwrap_err() {
            RouterError::NoCandidate { task, rejected } => {
                assert_eq!(task, TaskKind::Chat);
                assert_eq!(rejected.len(), 1);
                assert!(matches!(rejected[0].reason, RejectReason::Cost { .. }));
            }
            other => std::panic::panic_any(format!("unexpected error: {other}")),
        }
    }

    #[test]
    fn test_plan_rejects_each_constraint() {
        let d = chat("x", 0.0, 1_000, 0.5).with_max_context(1_000);
        let cap = RequestContext::new(TaskKind::Code);
        assert_eq!(Selector::check(&d, &cap), Some(RejectReason::Capability));

        let lat = RequestContext::new(TaskKind::Chat).with_max_latency(Duration::from_millis(1_200));
        assert!(matches!(Selector::check(&d, &lat), Some(RejectReason::Latency { .. })));

        let q = RequestContext::new(TaskKind::Chat).with_min_quality(0.6);
        assert!(matches!(Selector::check(&d, &q), Some(RejectReason::Quality { .. })));

        let ctx = RequestContext::new(TaskKind::Chat).with_complexity(Complexity::High);
        assert!(matches!(Selector::check(&d, &ctx), Some(RejectReason::Context { .. })));

        let ok = RequestContext::new(TaskKind::Chat).with_complexity(Complexity::Low);
        assert_eq!(Selector::check(&d, &ok), None);
    }

    #[test]
    fn test_plan_empty_catalog_is_no_candidate() {
        let (selector, _) = setup(vec![]);
        let err = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap_err();
        assert!(matches!(err, RouterError::NoCandidate { ref rejected, .. } if rejected.is_empty()));
    }

    #[test]
    fn test_plan_general_capability_accepts_any_task() {
        let d = BackendDescriptor::new("gen", "echo", 0.0, 500, 0.8).with_capability(TaskKind::General, 0.5);
        let (selector, _) = setup(vec![d]);
        let plan = selector.plan(&RequestContext::new(TaskKind::Translation)).unwrap();
        assert_eq!(plan.primary, "gen");
    }

    #[test]
    fn test_plan_invalid_context_rejected() {
        let (selector, _) = setup(vec![chat("a", 0.0, 500, 0.8)]);
        let ctx = RequestContext::new(TaskKind::Chat).with_min_quality(2.0);
        assert!(matches!(selector.plan(&ctx), Err(RouterError::InvalidRequest(_))));
    }

    #[test]
    fn test_critical_prefers_quality_low_prefers_cost() {
        let (selector, _) = setup(vec![
            chat("cheap", 0.000_1, 500, 0.6),
            chat("premium", 0.000_2, 500, 0.95),
        ]);
        let critical = selector
            .plan(&RequestContext::new(TaskKind::Chat).with_priority(Priority::Critical))
            .unwrap();
        let low = selector
            .plan(&RequestContext::new(TaskKind::Chat).with_priority(Priority::Low))
            .unwrap();
        assert_eq!(critical.primary, "premium");
        assert_eq!(low.primary, "cheap");
    }

    #[test]
    fn test_history_demotes_failing_backend() {
        let (selector, learning) = setup(vec![chat("a", 0.0, 500, 0.8), chat("b", 0.0, 500, 0.8)]);
        for _ in 0..20 {
            learning.record(OutcomeRecord::failure("r", "a", TaskKind::Chat, Duration::ZERO, "boom"));
        }
        let plan = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap();
        assert_eq!(plan.primary, "b");
    }

    #[test]
    fn test_confidence_rises_with_history() {
        let (selector, learning) = setup(vec![chat("a", 0.0, 500, 0.8)]);
        let before = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap().confidence;
        for _ in 0..50 {
            learning.record(OutcomeRecord::success("r", "a", TaskKind::Chat, 0.0, Duration::ZERO, 0.8));
        }
        let after = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap().confidence;
        assert!(after > before, "{after} should exceed {before}");
        assert!((0.0..=1.0).contains(&after));
    }

    #[test]
    fn test_disabled_backend_not_planned() {
        let (selector, _) = setup(vec![chat("a", 0.0, 500, 0.9), chat("b", 0.0, 500, 0.5)]);
        selector.catalog.disable("a").unwrap();
        let plan = selector.plan(&RequestContext::new(TaskKind::Chat)).unwrap();
        assert_eq!(plan.primary, "b");
        assert!(plan.fallbacks.is_empty());
    }
}
