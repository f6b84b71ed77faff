//! pkrguard delusion detector
//!
//! Finds known defects in Packer configurations and scores how likely the
//! configuration is to misbehave.
//!
//! # Core Concepts
//!
//! - **Structural pass**: patterns evaluated against normalized fields
//! - **Textual pass**: regexes over raw source, usable on unparseable input
//! - [`DelusionAnalysis`]: deduplicated findings, severity counts, and a
//!   monotonic confidence score
//! - [`DelusionDetector`]: cached, coalesced, time-bounded analysis

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod analysis;
mod audit;
mod detector;
mod error;
mod matching;

pub use analysis::{
    confidence_score, consolidate, Coverage, DelusionAnalysis, LearningOpportunity,
    RemediationStep, UNCERTAIN_BAND,
};
pub use audit::{AuditRecord, AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use detector::{run_analysis, DelusionDetector, DetectorConfig, DetectorStats};
pub use error::DetectorError;
pub use matching::{section_sizes, structural_matches, textual_matches};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
