//! User corrections and the confidence arithmetic they drive

use chrono::{DateTime, Utc};
use pkrguard_config::ConfigHash;
use serde::{Deserialize, Serialize};

/// Step size for promote/demote
pub const LEARNING_RATE: f64 = 0.1;

/// Learned confidence never leaves this range
pub const CONFIDENCE_FLOOR: f64 = 0.05;
pub const CONFIDENCE_CEILING: f64 = 0.99;

/// Move confidence a step toward 1.0
#[inline]
#[must_use]
pub fn promoted(confidence: f64) -> f64 {
    clamp_learned(confidence + LEARNING_RATE * (1.0 - confidence))
}

/// Move confidence a step toward 0.0
#[inline]
#[must_use]
pub fn demoted(confidence: f64) -> f64 {
    clamp_learned(confidence - LEARNING_RATE * confidence)
}

#[inline]
fn clamp_learned(confidence: f64) -> f64 {
    confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// What the reviewer said about a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The finding was real
    Confirmed,
    /// The finding was wrong
    FalsePositive,
    /// Overwrite the confidence outright
    SetConfidence { confidence: f64 },
}

/// A correction submitted against one pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    #[serde(flatten)]
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Configuration the finding was reported on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<ConfigHash>,
}

impl Correction {
    #[must_use]
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            author: None,
            note: None,
            config_hash: None,
        }
    }

    #[must_use]
    pub fn confirmed() -> Self {
        Self::new(Verdict::Confirmed)
    }

    #[must_use]
    pub fn false_positive() -> Self {
        Self::new(Verdict::FalsePositive)
    }

    #[must_use]
    pub fn set_confidence(confidence: f64) -> Self {
        Self::new(Verdict::SetConfidence { confidence })
    }

    #[must_use]
    pub fn by(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    #[must_use]
    pub fn on(mut self, config_hash: ConfigHash) -> Self {
        self.config_hash = Some(config_hash);
        self
    }

    /// Confidence after applying this correction to `current`
    ///
    /// Explicit overrides are taken as given (within [0, 1]); verdicts move
    /// by one learning step.
    #[must_use]
    pub fn apply(&self, current: f64) -> f64 {
        match self.verdict {
            Verdict::Confirmed => promoted(current),
            Verdict::FalsePositive => demoted(current),
            Verdict::SetConfidence { confidence } => confidence.clamp(0.0, 1.0),
        }
    }
}

/// One entry of a pattern's correction history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    /// Per-pattern sequence number, starting at 1
    pub sequence: u64,
    /// Store version the correction produced
    pub store_version: u64,
    pub recorded_at: DateTime<Utc>,
    pub correction: Correction,
    pub confidence_before: f64,
    pub confidence_after: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_and_demote_stay_clamped() {
        let mut c = 0.5;
        for _ in 0..200 {
            c = promoted(c);
        }
        assert!((c - CONFIDENCE_CEILING).abs() < 1e-9);
        for _ in 0..200 {
            c = demoted(c);
        }
        assert!((c - CONFIDENCE_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn promote_moves_toward_one() {
        assert!((promoted(0.5) - 0.55).abs() < 1e-9);
        assert!((demoted(0.5) - 0.45).abs() < 1e-9);
    }

    #[test]
    fn set_confidence_overrides() {
        assert!((Correction::set_confidence(0.2).apply(0.9) - 0.2).abs() < f64::EPSILON);
        assert!((Correction::set_confidence(3.0).apply(0.9) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_shape() {
        let c = Correction::set_confidence(0.4).by("ops").with_note("too noisy");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["verdict"], "set_confidence");
        assert_eq!(json["author"], "ops");
        let back: Correction = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
