//! Backend scoring.
//!
//! Produces a score in `0.0..=1.0` for a candidate backend given a request
//! context. The score drives candidate ordering in the selector:
//!
//! | Signal              | Default weight | Value                                        |
//! |---------------------|----------------|----------------------------------------------|
//! | Quality             | 0.40           | live catalog quality                         |
//! | Cost efficiency     | 0.30           | `1 - est_cost / max_est_cost` over catalog   |
//! | Latency efficiency  | 0.20           | `1 - scaled_latency / reference`, clamped    |
//! | Capability          | 0.10           | task (or `general`) rating                   |
//!
//! `critical` requests add the priority bias to the quality weight, `low`
//! requests add it to the cost weight; weights are then renormalised.
//!
//! The static score is blended with a historical composite of recent
//! success rate (0.5), mean quality (0.3) and cost efficiency of the mean
//! observed cost (0.2). Backends without history score a neutral 0.5.

use crate::catalog::BackendDescriptor;
use crate::learning::PerformanceStats;
use crate::request::{Priority, RequestContext};

use super::config::SelectorConfig;

/// Historical score used when a backend has no recorded outcomes.
pub const NEUTRAL_HISTORY: f64 = 0.5;

/// Normalised static score weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    /// Quality weight.
    pub quality: f64,
    /// Cost efficiency weight.
    pub cost: f64,
    /// Latency efficiency weight.
    pub latency: f64,
    /// Capability weight.
    pub capability: f64,
}

impl Weights {
    /// Weights for `priority`, renormalised to sum to one.
    pub fn for_priority(config: &SelectorConfig, priority: Priority) -> Self {
        let mut w = Self {
            quality: config.quality_weight,
            cost: config.cost_weight,
            latency: config.latency_weight,
            capability: config.capability_weight,
        };
        match priority {
            Priority::Critical => w.quality += config.priority_bias,
            Priority::Low => w.cost += config.priority_bias,
            Priority::Normal | Priority::High => {}
        }
        let sum = w.quality + w.cost + w.latency + w.capability;
        if sum > 0.0 {
            w.quality /= sum;
            w.cost /= sum;
            w.latency /= sum;
            w.capability /= sum;
        }
        w
    }
}

/// Per-signal contributions for one candidate, kept for plan justification.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    /// Live quality.
    pub quality: f64,
    /// Cost efficiency in `[0.0, 1.0]`.
    pub cost_efficiency: f64,
    /// Latency efficiency in `[0.0, 1.0]`.
    pub latency_efficiency: f64,
    /// Capability rating for the task.
    pub capability: f64,
    /// Weighted static score.
    pub static_score: f64,
    /// Historical composite (neutral when there is no history).
    pub historical: f64,
    /// Final blended score.
    pub blended: f64,
    /// Samples behind the historical composite.
    pub samples: usize,
}

/// `1 - cost / max_cost`, clamped. A zero maximum makes every backend free.
pub fn cost_efficiency(cost: f64, max_cost: f64) -> f64 {
    if max_cost <= 0.0 || !max_cost.is_finite() {
        return 1.0;
    }
    (1.0 - cost / max_cost).clamp(0.0, 1.0)
}

/// `1 - latency / reference`, clamped.
pub fn latency_efficiency(latency_ms: f64, reference_ms: u64) -> f64 {
    if reference_ms == 0 {
        return 0.0;
    }
    (1.0 - latency_ms / reference_ms as f64).clamp(0.0, 1.0)
}

/// Historical composite, or [`NEUTRAL_HISTORY`] when `stats` is `None`.
pub fn historical_score(stats: Option<&PerformanceStats>, max_est_cost: f64) -> f64 {
    match stats {
        Some(s) if s.samples > 0 => {
            // Cost credit only comes from attempts that were paid for.
            let cost_term = if s.success_rate > 0.0 {
                cost_efficiency(s.mean_cost, max_est_cost)
            } else {
                0.0
            };
            (0.5 * s.success_rate + 0.3 * s.mean_quality + 0.2 * cost_term).clamp(0.0, 1.0)
        }
        _ => NEUTRAL_HISTORY,
    }
}

/// Score one candidate.
///
/// `max_est_cost` is the largest estimated cost for the request's tier over
/// the enabled catalog. The caller has already checked that the backend
/// supports the task; a missing rating contributes zero.
pub fn score(
    descriptor: &BackendDescriptor,
    ctx: &RequestContext,
    config: &SelectorConfig,
    max_est_cost: f64,
    stats: Option<&PerformanceStats>,
) -> ScoreBreakdown {
    let weights = Weights::for_priority(config, ctx.priority);

    let quality = descriptor.quality.clamp(0.0, 1.0);
    let cost_eff = cost_efficiency(descriptor.estimate_cost(ctx.complexity), max_est_cost);
    let latency_eff = latency_efficiency(
        descriptor.estimate_latency_ms(ctx.complexity),
        config.latency_reference_ms,
    );
    let capability = descriptor.capability_for(ctx.task).unwrap_or(0.0).clamp(0.0, 1.0);

    let static_score = (weights.quality * quality
        + weights.cost * cost_eff
        + weights.latency * latency_eff
        + weights.capability * capability)
        .clamp(0.0, 1.0);
    let historical = historical_score(stats, max_est_cost);
    let blend = config.static_blend.clamp(0.0, 1.0);
    let blended = (blend * static_score + (1.0 - blend) * historical).clamp(0.0, 1.0);

    ScoreBreakdown {
        quality,
        cost_efficiency: cost_eff,
        latency_efficiency: latency_eff,
        capability,
        static_score,
        historical,
        blended,
        samples: stats.map(|s| s.samples).unwrap_or(0),
    }
}

/// Plan confidence: the blended score scaled by how much evidence backs it.
pub fn confidence(blended: f64, samples: usize, window: usize) -> f64 {
    let evidence = if window == 0 {
        0.0
    } else {
        (samples as f64 / window as f64).min(1.0)
    };
    (blended * (0.6 + 0.4 * evidence)).clamp(0.0, 1.0)
}

// ── Tests ──────────────────────────────────────────────────────────────
