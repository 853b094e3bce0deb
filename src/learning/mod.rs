//! # Stage: Outcome Learning
//!
//! ## Responsibility
//! Record the outcome of every backend attempt, derive recent per-backend,
//! per-task performance statistics, and nudge each backend's static quality
//! toward what it actually delivers.
//!
//! ## Guarantees
//! - Bounded: the outcome ring and every per-(backend, task) window have a
//!   fixed capacity with oldest-first eviction.
//! - Slow-moving: quality nudges move at most `learning_rate` of the gap per
//!   outcome and always stay in `[0.0, 1.0]`.
//! - Observable: every record is broadcast to feed subscribers.
//!
//! ## NOT Responsible For
//! - Ranking backends (that belongs to `routing`)
//! - Cost ledgers or business reporting (feed consumers do that)

pub mod feedback;
pub mod history;

pub use feedback::{estimate_quality, nudge_quality, LearningConfig, LearningStore};
pub use history::{OutcomeHistory, OutcomeRecord, PerformanceStats};
