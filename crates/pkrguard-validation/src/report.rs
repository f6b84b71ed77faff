//! Validation reports

use crate::hints::PerformanceHint;
use crate::metrics::{ArtifactCheck, MetricScores};
use crate::scoring::{Dimension, DimensionScores};
use pkrguard_config::ConfigHash;
use pkrguard_detector::{Coverage, DelusionAnalysis};
use pkrguard_patterns::{DelusionPattern, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static validation of one configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub config_hash: ConfigHash,
    /// Pattern store version the findings came from
    pub store_version: u64,
    pub coverage: Coverage,
    pub dimensions: DimensionScores,
    pub overall: f64,
    pub findings: Vec<DelusionPattern>,
    pub severity_distribution: BTreeMap<Severity, usize>,
    pub hints: Vec<PerformanceHint>,
    /// What to change to raise the score, most severe first
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    /// Assemble a report from an analysis, scored dimensions and hints
    #[must_use]
    pub fn new(analysis: &DelusionAnalysis, dimensions: DimensionScores, hints: Vec<PerformanceHint>) -> Self {
        let mut remediation_hints: Vec<String> = analysis
            .remediation_plan
            .iter()
            .map(|step| format!("[{}] {}: {}", step.severity, step.description, step.remediation))
            .collect();
        remediation_hints.extend(
            hints
                .iter()
                .map(|h| format!("[performance] {} ({}): {}", h.message, h.component, h.recommendation)),
        );

        Self {
            config_hash: analysis.config_hash,
            store_version: analysis.store_version,
            coverage: analysis.coverage,
            overall: dimensions.overall(),
            dimensions,
            findings: analysis.patterns.clone(),
            severity_distribution: analysis.severity_distribution.clone(),
            hints,
            remediation_hints,
        }
    }

    /// Dimensions below `threshold`
    #[must_use]
    pub fn failing_dimensions(&self, threshold: f64) -> Vec<Dimension> {
        self.dimensions.below(threshold)
    }

    /// Overall and every dimension at or above `threshold`
    #[must_use]
    pub fn meets(&self, threshold: f64) -> bool {
        self.overall >= threshold && self.failing_dimensions(threshold).is_empty()
    }

    pub(crate) fn rescore(&mut self, dimensions: DimensionScores) {
        self.overall = dimensions.overall();
        self.dimensions = dimensions;
    }
}

/// Static report plus what the build itself showed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiDimReport {
    /// Dimensions and overall already include the build evidence
    pub report: ValidationReport,
    pub metrics: MetricScores,
    pub artifacts: Vec<ArtifactCheck>,
    pub build_succeeded: bool,
}

impl MultiDimReport {
    #[must_use]
    pub fn checksum_mismatches(&self) -> usize {
        self.artifacts.iter().filter(|a| !a.matches).count()
    }
}

/// Performance subset of a validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub config_hash: ConfigHash,
    pub performance: f64,
    pub hints: Vec<PerformanceHint>,
}

impl OptimizationReport {
    #[must_use]
    pub fn recommendations(&self) -> Vec<&str> {
        self.hints.iter().map(|h| h.recommendation.as_str()).collect()
    }
}
