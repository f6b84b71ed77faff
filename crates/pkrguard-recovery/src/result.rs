//! Recovery outcomes

use crate::diagnosis::FailureType;
use crate::executor::Backup;
use crate::plan::RollbackPlan;
use crate::state_machine::RecoveryState;
use pkrguard_config::ConfigHash;
use pkrguard_detector::DelusionAnalysis;
use pkrguard_patterns::PatternId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    RolledBack { reason: String },
    Escalated { reason: String, evidence: Vec<String> },
}

/// A step that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFix {
    pub step_id: String,
    pub action: String,
    pub description: String,
    pub attempts: u32,
}

/// Before/after comparison of a configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryValidation {
    pub before_score: f64,
    pub after_score: f64,
    pub before_findings: usize,
    pub after_findings: usize,
    /// Critical or high patterns present only after
    pub new_blocking: Vec<PatternId>,
    /// Patterns present only before
    pub cleared: Vec<PatternId>,
    pub improved: bool,
    pub success: bool,
}

/// Compare two analyses of the same configuration
///
/// Success needs no new critical/high pattern, and a strictly lower delusion
/// confidence when there were findings before. A clean configuration must
/// stay clean.
#[must_use]
pub fn compare_analyses(before: &DelusionAnalysis, after: &DelusionAnalysis) -> RecoveryValidation {
    let before_ids = before.pattern_ids();
    let after_ids = after.pattern_ids();

    let new_blocking: BTreeSet<PatternId> = after
        .patterns
        .iter()
        .filter(|p| p.severity.is_blocking() && !before_ids.contains(&p.id))
        .map(|p| p.id.clone())
        .collect();
    let cleared: Vec<PatternId> = before_ids.difference(&after_ids).cloned().collect();

    let improved = if before.is_clean() {
        after.is_clean()
    } else {
        after.confidence_score < before.confidence_score
    };

    RecoveryValidation {
        before_score: before.confidence_score,
        after_score: after.confidence_score,
        before_findings: before.patterns.len(),
        after_findings: after.patterns.len(),
        success: improved && new_blocking.is_empty(),
        new_blocking: new_blocking.into_iter().collect(),
        cleared,
        improved,
    }
}

/// What the feedback loop needs from an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningData {
    pub failure_type: FailureType,
    pub template: String,
    pub cleared_patterns: Vec<PatternId>,
    /// States the attempt went through
    pub states: Vec<RecoveryState>,
}

/// Result of executing a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub plan_id: String,
    pub config_hash: ConfigHash,
    pub success: bool,
    pub outcome: Outcome,
    pub applied_fixes: Vec<AppliedFix>,
    /// Drop in delusion confidence; negative if things got worse
    pub confidence_improvement: f64,
    pub validation: Option<RecoveryValidation>,
    pub rollback_plan: Option<RollbackPlan>,
    pub backups: Vec<Backup>,
    pub learning_data: LearningData,
    pub execution_time_ms: u64,
}

impl RecoveryResult {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, Outcome::Committed)
    }

    #[must_use]
    pub fn is_escalated(&self) -> bool {
        matches!(self.outcome, Outcome::Escalated { .. })
    }

    /// Final state of the attempt
    #[must_use]
    pub fn final_state(&self) -> Option<RecoveryState> {
        self.learning_data.states.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkrguard_detector::Coverage;
    use pkrguard_patterns::{DelusionPattern, PatternKind, Severity, SeverityWeights};

    fn analysis(patterns: Vec<DelusionPattern>) -> DelusionAnalysis {
        DelusionAnalysis::assemble(
            ConfigHash::compute(b"c"),
            1,
            Coverage::Full,
            patterns,
            &SeverityWeights::default(),
        )
    }

    fn pattern(expr: &str, severity: Severity, confidence: f64) -> DelusionPattern {
        DelusionPattern::new(PatternKind::Build, severity, expr, "d", "r", confidence)
    }

    #[test]
    fn clearing_a_finding_succeeds() {
        let before = analysis(vec![pattern("empty:provisioners", Severity::Medium, 0.6)]);
        let after = analysis(vec![]);
        let v = compare_analyses(&before, &after);
        assert!(v.success);
        assert_eq!(v.cleared.len(), 1);
    }

    #[test]
    fn new_blocking_finding_fails_even_if_score_drops() {
        let before = analysis(vec![
            pattern("empty:provisioners", Severity::Critical, 0.95),
            pattern("empty:builders", Severity::Critical, 0.95),
        ]);
        let after = analysis(vec![pattern("unresolved-variable", Severity::High, 0.2)]);
        let v = compare_analyses(&before, &after);
        assert!(v.improved);
        assert!(!v.success);
        assert_eq!(v.new_blocking.len(), 1);
    }

    #[test]
    fn unchanged_findings_are_not_an_improvement() {
        let before = analysis(vec![pattern("empty:provisioners", Severity::Low, 0.4)]);
        let v = compare_analyses(&before, &before.clone());
        assert!(!v.improved);
        assert!(!v.success);
    }

    #[test]
    fn clean_must_stay_clean() {
        let clean = analysis(vec![]);
        assert!(compare_analyses(&clean, &clean).success);
        let dirty = analysis(vec![pattern("empty:provisioners", Severity::Low, 0.4)]);
        assert!(!compare_analyses(&clean, &dirty).success);
    }
}
