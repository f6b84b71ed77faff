//! pkrguard pattern store
//!
//! Known configuration defects ("delusions"), the versioned store that owns
//! them, and the feedback loop that adjusts their confidence.
//!
//! # Core Concepts
//!
//! - [`DelusionPattern`]: one defect pattern with its matcher expression
//! - [`Matcher`]: compiled form of the expression
//! - [`PatternStore`]: copy-on-write snapshots plus per-pattern histories
//! - [`LearningLoop`]: per-configuration FIFO lanes applying learning events

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod builtin;
mod correction;
mod learning;
mod pattern;
mod store;

pub use correction::{
    demoted, promoted, Correction, CorrectionRecord, Verdict, CONFIDENCE_CEILING,
    CONFIDENCE_FLOOR, LEARNING_RATE,
};
pub use learning::{
    apply_event, Feedback, LearningError, LearningEvent, LearningHandle, LearningLoop, LearningStats,
    DEFAULT_LANE_IDLE,
};
pub use pattern::{
    CompiledPattern, DelusionPattern, Matcher, Pass, PatternError, PatternId, PatternKind,
    Severity, SeverityWeights,
};
pub use store::{
    Change, LogEntry, PatternSnapshot, PatternSource, PatternStore, StoreError, TemplateStats,
    REVIEW_THRESHOLD,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
