//! Analysis results and the pure functions that assemble them

use pkrguard_config::{ConfigHash, Location};
use pkrguard_patterns::{DelusionPattern, PatternId, PatternKind, Severity, SeverityWeights};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Confidence range treated as uncertain and worth human review
pub const UNCERTAIN_BAND: (f64, f64) = (0.4, 0.7);

/// How much of the configuration the analysis covered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    /// Structural and textual passes
    Full,
    /// Textual pass only (input could not be parsed)
    TextualOnly,
}

/// One remediation entry per matched pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationStep {
    pub pattern_id: PatternId,
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub severity: Severity,
    pub description: String,
    pub remediation: String,
    pub locations: Vec<Location>,
}

/// A matched pattern whose confidence is uncertain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningOpportunity {
    pub pattern_id: PatternId,
    pub confidence: f64,
    pub occurrences: usize,
    pub description: String,
}

/// Result of one analysis run
///
/// Deterministic for a fixed store version and configuration: no
/// timestamps, all collections ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelusionAnalysis {
    pub config_hash: ConfigHash,
    pub store_version: u64,
    pub coverage: Coverage,
    pub patterns: Vec<DelusionPattern>,
    pub severity_distribution: BTreeMap<Severity, usize>,
    pub confidence_score: f64,
    pub remediation_plan: Vec<RemediationStep>,
    pub learning_opportunities: Vec<LearningOpportunity>,
}

impl DelusionAnalysis {
    /// Assemble an analysis from raw matches
    #[must_use]
    pub fn assemble(
        config_hash: ConfigHash,
        store_version: u64,
        coverage: Coverage,
        matches: Vec<DelusionPattern>,
        weights: &SeverityWeights,
    ) -> Self {
        let patterns = consolidate(matches);
        let mut severity_distribution = BTreeMap::new();
        for p in &patterns {
            *severity_distribution.entry(p.severity).or_insert(0) += 1;
        }
        Self {
            config_hash,
            store_version,
            coverage,
            confidence_score: confidence_score(&patterns, weights),
            remediation_plan: remediation_plan(&patterns),
            learning_opportunities: learning_opportunities(&patterns),
            severity_distribution,
            patterns,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Any critical or high finding
    #[must_use]
    pub fn has_blocking_findings(&self) -> bool {
        self.patterns.iter().any(|p| p.severity.is_blocking())
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.severity_distribution.get(&severity).copied().unwrap_or(0)
    }

    /// Distinct pattern ids
    #[must_use]
    pub fn pattern_ids(&self) -> BTreeSet<PatternId> {
        self.patterns.iter().map(|p| p.id.clone()).collect()
    }

    /// Findings of one kind
    pub fn of_kind(&self, kind: PatternKind) -> impl Iterator<Item = &DelusionPattern> {
        self.patterns.iter().filter(move |p| p.kind == kind)
    }
}

/// Aggregate confidence that the configuration contains delusions
///
/// `1 - Π(1 - confidence · weight(severity))` over every pattern. This is a
/// severity-weighted noisy-OR, not `1 - Π(1 - confidence)` taken over the
/// most severe class present: lower-severity findings still raise the score,
/// discounted by their weight, and a critical finding outscores a low one of
/// the same confidence.
///
/// Each factor lies in [0, 1], so adding a pattern never lowers the score and
/// lowering any pattern's confidence never raises it. No patterns gives 0.
#[must_use]
pub fn confidence_score(patterns: &[DelusionPattern], weights: &SeverityWeights) -> f64 {
    let miss: f64 = patterns
        .iter()
        .map(|p| 1.0 - p.confidence.clamp(0.0, 1.0) * weights.weight(p.severity))
        .product();
    (1.0 - miss).clamp(0.0, 1.0)
}

/// Deduplicate and order matches
///
/// Exact `(pattern_id, location)` duplicates collapse. Among different
/// patterns at one position the highest severity survives (then higher
/// confidence, then lower id). Whole-file findings never compete with each
/// other. Output is ordered by severity, location, id.
#[must_use]
pub fn consolidate(matches: Vec<DelusionPattern>) -> Vec<DelusionPattern> {
    let mut unique: BTreeMap<(PatternId, Option<Location>), DelusionPattern> = BTreeMap::new();
    for m in matches {
        unique.entry((m.id.clone(), m.location.clone())).or_insert(m);
    }

    let mut by_position: HashMap<(String, usize, usize), DelusionPattern> = HashMap::new();
    let mut unanchored = Vec::new();
    for (_, m) in unique {
        match &m.location {
            Some(loc) if loc.line > 0 => {
                let key = (loc.file.clone(), loc.line, loc.column);
                match by_position.get(&key) {
                    Some(current) if outranks(current, &m) => {}
                    _ => {
                        by_position.insert(key, m);
                    }
                }
            }
            _ => unanchored.push(m),
        }
    }

    let mut out: Vec<DelusionPattern> = by_position.into_values().chain(unanchored).collect();
    out.sort_by(|a, b| {
        Reverse(a.severity)
            .cmp(&Reverse(b.severity))
            .then_with(|| a.location.cmp(&b.location))
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

fn outranks(a: &DelusionPattern, b: &DelusionPattern) -> bool {
    match a.severity.cmp(&b.severity) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match a.confidence.total_cmp(&b.confidence) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => a.id < b.id,
        },
    }
}

fn remediation_plan(patterns: &[DelusionPattern]) -> Vec<RemediationStep> {
    let mut steps: Vec<RemediationStep> = Vec::new();
    for p in patterns {
        if let Some(step) = steps.iter_mut().find(|s| s.pattern_id == p.id) {
            step.locations.extend(p.location.clone());
            continue;
        }
        steps.push(RemediationStep {
            pattern_id: p.id.clone(),
            kind: p.kind,
            severity: p.severity,
            description: p.description.clone(),
            remediation: p.remediation.clone(),
            locations: p.location.clone().into_iter().collect(),
        });
    }
    steps
}

fn learning_opportunities(patterns: &[DelusionPattern]) -> Vec<LearningOpportunity> {
    let (low, high) = UNCERTAIN_BAND;
    let mut out: Vec<LearningOpportunity> = Vec::new();
    for p in patterns.iter().filter(|p| p.confidence >= low && p.confidence < high) {
        match out.iter_mut().find(|o| o.pattern_id == p.id) {
            Some(o) => o.occurrences += 1,
            None => out.push(LearningOpportunity {
                pattern_id: p.id.clone(),
                confidence: p.confidence,
                occurrences: 1,
                description: p.description.clone(),
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pat(expr: &str, severity: Severity, confidence: f64, line: usize) -> DelusionPattern {
        let p = DelusionPattern::new(PatternKind::Security, severity, expr, "d", "r", confidence);
        if line == 0 {
            p
        } else {
            p.at(Location {
                file: "t.json".into(),
                line,
                column: 3,
                length: 4,
            })
        }
    }

    #[test]
    fn empty_scores_zero() {
        assert!(confidence_score(&[], &SeverityWeights::default()).abs() < f64::EPSILON);
    }

    #[test]
    fn single_critical_scores_its_confidence() {
        let score = confidence_score(&[pat("text:a", Severity::Critical, 0.9, 1)], &SeverityWeights::default());
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn every_severity_contributes_by_weight() {
        let weights = SeverityWeights::default();
        let critical = pat("text:c", Severity::Critical, 0.9, 1);
        let low = pat("text:l", Severity::Low, 0.5, 2);

        let both = confidence_score(&[critical.clone(), low.clone()], &weights);
        assert!((both - (1.0 - 0.1 * (1.0 - 0.5 * 0.35))).abs() < 1e-9);
        assert!(both > confidence_score(&[critical], &weights));

        let low_alone = confidence_score(&[low], &weights);
        assert!((low_alone - 0.175).abs() < 1e-9);
        let critical_same = confidence_score(&[pat("text:c", Severity::Critical, 0.5, 1)], &weights);
        assert!(critical_same > low_alone);
    }

    #[test]
    fn exact_duplicates_collapse() {
        let a = pat("text:a", Severity::High, 0.8, 2);
        let out = consolidate(vec![a.clone(), a]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn highest_severity_wins_a_position() {
        let low = pat("text:low", Severity::Low, 0.99, 2);
        let high = pat("text:high", Severity::High, 0.5, 2);
        let out = consolidate(vec![low, high.clone()]);
        assert_eq!(out, vec![high]);
    }

    #[test]
    fn confidence_breaks_severity_ties() {
        let a = pat("text:a", Severity::High, 0.6, 2);
        let b = pat("text:b", Severity::High, 0.7, 2);
        assert_eq!(consolidate(vec![a, b.clone()]), vec![b]);
    }

    #[test]
    fn whole_file_findings_all_survive() {
        let a = pat("empty:builders", Severity::Critical, 0.9, 0);
        let b = pat("empty:provisioners", Severity::Low, 0.4, 0);
        assert_eq!(consolidate(vec![a, b]).len(), 2);
    }

    #[test]
    fn ordered_by_severity_then_location() {
        let out = consolidate(vec![
            pat("text:a", Severity::Low, 0.5, 1),
            pat("text:b", Severity::Critical, 0.5, 9),
            pat("text:c", Severity::Critical, 0.5, 4),
        ]);
        let lines: Vec<usize> = out.iter().map(|p| p.location.as_ref().unwrap().line).collect();
        assert_eq!(lines, vec![4, 9, 1]);
    }

    #[test]
    fn assemble_fills_every_section() {
        let analysis = DelusionAnalysis::assemble(
            ConfigHash::compute(b"c"),
            3,
            Coverage::Full,
            vec![
                pat("text:a", Severity::Critical, 0.9, 1),
                pat("text:u", Severity::Low, 0.5, 2),
                pat("text:u", Severity::Low, 0.5, 3),
            ],
            &SeverityWeights::default(),
        );
        assert_eq!(analysis.count(Severity::Critical), 1);
        assert_eq!(analysis.count(Severity::Low), 2);
        assert_eq!(analysis.remediation_plan.len(), 2);
        assert_eq!(analysis.remediation_plan[1].locations.len(), 2);
        assert_eq!(analysis.learning_opportunities.len(), 1);
        assert_eq!(analysis.learning_opportunities[0].occurrences, 2);
        assert!(analysis.has_blocking_findings());
    }

    fn severity() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Critical),
            Just(Severity::High),
            Just(Severity::Medium),
            Just(Severity::Low),
        ]
    }

    proptest! {
        #[test]
        fn adding_a_pattern_never_lowers_the_score(
            base in prop::collection::vec((severity(), 0.0f64..=1.0), 0..8),
            extra in (severity(), 0.0f64..=1.0),
        ) {
            let weights = SeverityWeights::default();
            let mut patterns: Vec<DelusionPattern> = base
                .iter()
                .enumerate()
                .map(|(i, (s, c))| pat(&format!("text:p{i}"), *s, *c, i + 1))
                .collect();
            let before = confidence_score(&patterns, &weights);
            patterns.push(pat("text:extra", extra.0, extra.1, 99));
            let after = confidence_score(&patterns, &weights);
            prop_assert!(after >= before - 1e-12);
            prop_assert!((0.0..=1.0).contains(&after));
        }

        #[test]
        fn lowering_confidence_never_raises_the_score(
            base in prop::collection::vec((severity(), 0.0f64..=1.0), 1..8),
            factor in 0.0f64..=1.0,
        ) {
            let weights = SeverityWeights::default();
            let mut patterns: Vec<DelusionPattern> = base
                .iter()
                .enumerate()
                .map(|(i, (s, c))| pat(&format!("text:p{i}"), *s, *c, i + 1))
                .collect();
            let before = confidence_score(&patterns, &weights);
            patterns[0].confidence *= factor;
            prop_assert!(confidence_score(&patterns, &weights) <= before + 1e-12);
        }
    }
}
