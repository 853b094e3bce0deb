//! # Stage: Backend Selection
//!
//! ## Responsibility
//! Turn a request's constraints into an [`OptimizationPlan`]: filter the
//! enabled catalog on hard constraints, rank survivors by a blend of static
//! merit and recent history, and pick a primary plus a short fallback chain.
//!
//! ## Guarantees
//! - Deterministic: the same catalog, history and context always produce
//!   the same plan; ties keep registration order.
//! - Non-repeating: a backend appears at most once per chain.
//! - Non-blocking: `plan()` performs no I/O.
//!
//! ## NOT Responsible For
//! - Calling backends (that belongs to `resilience`)
//! - Circuit or health state (the executor skips those at call time)

pub mod config;
pub mod scorer;
pub mod selector;

// Re-exports for convenience
pub use config::SelectorConfig;
pub use scorer::{ScoreBreakdown, Weights};
pub use selector::{OptimizationPlan, RejectReason, Rejection, Selector};
