//! Dimension scores and their weighted combination

use pkrguard_detector::DelusionAnalysis;
use pkrguard_patterns::{PatternKind, Severity};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Lowest static performance score, however many hints fire
pub const PERFORMANCE_FLOOR: f64 = 0.3;

/// Performance lost per hint
pub const PER_HINT_PENALTY: f64 = 0.1;

/// A scored aspect of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Functionality,
    Performance,
    Security,
    Compliance,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Functionality,
        Dimension::Performance,
        Dimension::Security,
        Dimension::Compliance,
    ];

    /// Share of the overall score
    #[inline]
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Dimension::Functionality => 0.4,
            Dimension::Performance => 0.1,
            Dimension::Security => 0.3,
            Dimension::Compliance => 0.2,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Dimension::Functionality => "functionality",
            Dimension::Performance => "performance",
            Dimension::Security => "security",
            Dimension::Compliance => "compliance",
        }
    }

    /// Dimension a finding of this kind counts against
    #[inline]
    #[must_use]
    pub const fn of_kind(kind: PatternKind) -> Self {
        match kind {
            PatternKind::Security => Dimension::Security,
            PatternKind::Architecture => Dimension::Compliance,
            PatternKind::Syntax | PatternKind::Build => Dimension::Functionality,
        }
    }
}

impl Display for Dimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score deducted for one finding at full confidence
#[inline]
#[must_use]
pub const fn severity_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 0.6,
        Severity::High => 0.35,
        Severity::Medium => 0.15,
        Severity::Low => 0.05,
    }
}

/// Four scores in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub functionality: f64,
    pub performance: f64,
    pub security: f64,
    pub compliance: f64,
}

impl Default for DimensionScores {
    fn default() -> Self {
        Self::perfect()
    }
}

impl DimensionScores {
    #[must_use]
    pub const fn perfect() -> Self {
        Self {
            functionality: 1.0,
            performance: 1.0,
            security: 1.0,
            compliance: 1.0,
        }
    }

    #[must_use]
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Functionality => self.functionality,
            Dimension::Performance => self.performance,
            Dimension::Security => self.security,
            Dimension::Compliance => self.compliance,
        }
    }

    pub fn set(&mut self, dimension: Dimension, value: f64) {
        let value = value.clamp(0.0, 1.0);
        match dimension {
            Dimension::Functionality => self.functionality = value,
            Dimension::Performance => self.performance = value,
            Dimension::Security => self.security = value,
            Dimension::Compliance => self.compliance = value,
        }
    }

    /// Weighted overall score
    #[must_use]
    pub fn overall(&self) -> f64 {
        generate_confidence_score(self)
    }

    /// Dimensions scoring below `threshold`, in fixed order
    #[must_use]
    pub fn below(&self, threshold: f64) -> Vec<Dimension> {
        Dimension::ALL
            .into_iter()
            .filter(|d| self.get(*d) < threshold)
            .collect()
    }

    /// `(dimension, score)` pairs in fixed order
    pub fn iter(&self) -> impl Iterator<Item = (Dimension, f64)> + '_ {
        Dimension::ALL.into_iter().map(|d| (d, self.get(d)))
    }
}

/// Weighted average of the four dimensions
///
/// The weights sum to 1, so the result stays in [0, 1].
#[must_use]
pub fn generate_confidence_score(scores: &DimensionScores) -> f64 {
    scores
        .iter()
        .map(|(d, s)| d.weight() * s.clamp(0.0, 1.0))
        .sum::<f64>()
        .clamp(0.0, 1.0)
}

/// Static performance score from the number of hints
#[must_use]
pub fn static_performance(hints: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let penalty = PER_HINT_PENALTY * hints as f64;
    (1.0 - penalty).max(PERFORMANCE_FLOOR)
}

/// Score an analysis and a hint count
#[must_use]
pub fn score_analysis(analysis: &DelusionAnalysis, hints: usize) -> DimensionScores {
    let mut deductions = [0.0_f64; 4];
    for pattern in &analysis.patterns {
        let slot = Dimension::ALL
            .iter()
            .position(|d| *d == Dimension::of_kind(pattern.kind))
            .unwrap_or(0);
        deductions[slot] += severity_penalty(pattern.severity) * pattern.confidence.clamp(0.0, 1.0);
    }

    let mut scores = DimensionScores::perfect();
    for (dimension, deduction) in Dimension::ALL.into_iter().zip(deductions) {
        scores.set(dimension, 1.0 - deduction);
    }
    scores.set(Dimension::Performance, static_performance(hints));
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkrguard_config::ConfigHash;
    use pkrguard_detector::Coverage;
    use pkrguard_patterns::{DelusionPattern, SeverityWeights};
    use proptest::prelude::*;

    fn analysis(patterns: Vec<DelusionPattern>) -> DelusionAnalysis {
        DelusionAnalysis::assemble(
            ConfigHash::compute(b"x"),
            1,
            Coverage::Full,
            patterns,
            &SeverityWeights::default(),
        )
    }

    #[test]
    fn weights_sum_to_one() {
        let total: f64 = Dimension::ALL.iter().map(|d| d.weight()).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!((DimensionScores::perfect().overall() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn critical_credential_hits_security_only() {
        let a = analysis(vec![DelusionPattern::new(
            PatternKind::Security,
            Severity::Critical,
            "text:secret",
            "d",
            "r",
            0.9,
        )]);
        let s = score_analysis(&a, 0);
        assert!((s.security - 0.46).abs() < 1e-9);
        assert_eq!(s.functionality, 1.0);
        assert_eq!(s.compliance, 1.0);
        assert_eq!(s.below(0.7), vec![Dimension::Security]);
    }

    #[test]
    fn architecture_findings_count_against_compliance() {
        let a = analysis(vec![DelusionPattern::new(
            PatternKind::Architecture,
            Severity::High,
            "empty:provisioners",
            "d",
            "r",
            1.0,
        )]);
        assert!((score_analysis(&a, 0).compliance - 0.65).abs() < 1e-9);
    }

    #[test]
    fn performance_has_a_floor() {
        assert_eq!(static_performance(0), 1.0);
        assert!((static_performance(2) - 0.8).abs() < 1e-9);
        assert_eq!(static_performance(50), PERFORMANCE_FLOOR);
    }

    proptest! {
        #[test]
        fn overall_stays_in_range(
            f in -1.0f64..2.0, p in -1.0f64..2.0, s in -1.0f64..2.0, c in -1.0f64..2.0,
        ) {
            let scores = DimensionScores { functionality: f, performance: p, security: s, compliance: c };
            let overall = generate_confidence_score(&scores);
            prop_assert!((0.0..=1.0).contains(&overall));
        }
    }
}
