//! pkrguard validation agent
//!
//! Scores Packer configurations along four dimensions and issues signed,
//! time-bounded certificates for the ones that pass.
//!
//! # Core Concepts
//!
//! - [`DimensionScores`]: functionality, performance, security, compliance
//! - [`ValidationReport`]: static scores from findings and performance hints
//! - [`MultiDimReport`]: static scores adjusted by build metrics and
//!   artifact checksums
//! - [`Certificate`]: Ed25519-signed attestation with an expiry
//! - [`CertificateStore`]: one JSON file per configuration hash

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod agent;
mod certificate;
mod error;
mod hints;
mod metrics;
mod report;
mod scoring;
mod store;

pub use agent::{ValidationAgent, DEFAULT_THRESHOLD};
pub use certificate::{Certificate, CertificateIssuer, DEFAULT_TTL_SECS, MAX_TTL_SECS};
pub use error::ValidationError;
pub use hints::{performance_hints, PerformanceHint, MAX_INLINE_COMMANDS, MAX_SHELL_PROVISIONERS};
pub use metrics::{
    score_metrics, sha256_file, verify_artifacts, ArtifactCheck, ArtifactRecord, BuildResult,
    MetricBaseline, MetricScores, CHECKSUM_PENALTY,
};
pub use report::{MultiDimReport, OptimizationReport, ValidationReport};
pub use scoring::{
    generate_confidence_score, score_analysis, severity_penalty, static_performance, Dimension,
    DimensionScores, PERFORMANCE_FLOOR, PER_HINT_PENALTY,
};
pub use store::CertificateStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
