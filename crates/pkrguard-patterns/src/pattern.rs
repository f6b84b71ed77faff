//! Delusion patterns and their matcher expressions
//!
//! A pattern's `pattern` field is a small expression compiled into a
//! [`Matcher`]. Expressions starting with `text:` run over raw source text;
//! every other form runs over the normalized field list.

use pkrguard_config::{Location, Section};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// What part of a configuration a pattern is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Syntax,
    Security,
    Architecture,
    Build,
}

impl PatternKind {
    pub const ALL: [PatternKind; 4] = [
        PatternKind::Syntax,
        PatternKind::Security,
        PatternKind::Architecture,
        PatternKind::Build,
    ];

    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PatternKind::Syntax => "syntax",
            PatternKind::Security => "security",
            PatternKind::Architecture => "architecture",
            PatternKind::Build => "build",
        }
    }
}

impl Display for PatternKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding severity
///
/// Ordered so that `Critical` is the greatest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Most severe first
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Critical and high findings fail `analyze`
    #[inline]
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-severity weights used when aggregating pattern confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            critical: 1.0,
            high: 0.85,
            medium: 0.6,
            low: 0.35,
        }
    }
}

impl SeverityWeights {
    #[inline]
    #[must_use]
    pub fn weight(&self, severity: Severity) -> f64 {
        let w = match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        };
        w.clamp(0.0, 1.0)
    }
}

/// Stable pattern identity: first 16 hex chars of `blake3(type | pattern)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(String);

impl PatternId {
    /// Derive the id of a `(kind, expression)` pair
    #[must_use]
    pub fn derive(kind: PatternKind, expression: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(expression.as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..16].to_string())
    }

    /// Wrap an id read from user input
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        (text.len() == 16 && text.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(text.to_ascii_lowercase()))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PatternId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A known defect pattern, or a match of one when `location` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelusionPattern {
    pub id: PatternId,
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub severity: Severity,
    /// Matcher expression
    pub pattern: String,
    pub description: String,
    pub remediation: String,
    pub confidence: f64,
    /// Bumped on every learned change
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl DelusionPattern {
    /// New pattern at version 1
    #[must_use]
    pub fn new(
        kind: PatternKind,
        severity: Severity,
        pattern: impl Into<String>,
        description: impl Into<String>,
        remediation: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let pattern = pattern.into();
        Self {
            id: PatternId::derive(kind, &pattern),
            kind,
            severity,
            pattern,
            description: description.into(),
            remediation: remediation.into(),
            confidence,
            version: 1,
            location: None,
        }
    }

    /// Copy of this pattern anchored at a location
    #[must_use]
    pub fn at(&self, location: Location) -> Self {
        Self {
            location: Some(location),
            ..self.clone()
        }
    }

    /// Check confidence range and id derivation
    ///
    /// # Errors
    /// [`PatternError::ConfidenceOutOfRange`] or [`PatternError::IdMismatch`].
    pub fn validate(&self) -> Result<(), PatternError> {
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(PatternError::ConfidenceOutOfRange {
                id: self.id.clone(),
                value: self.confidence,
            });
        }
        let expected = PatternId::derive(self.kind, &self.pattern);
        if expected != self.id {
            return Err(PatternError::IdMismatch {
                id: self.id.clone(),
                expected,
            });
        }
        Ok(())
    }
}

/// Errors compiling or validating patterns
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("invalid matcher expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("invalid regex in `{expression}`: {source}")]
    InvalidRegex {
        expression: String,
        #[source]
        source: regex::Error,
    },

    #[error("pattern {id} confidence {value} outside [0, 1]")]
    ConfidenceOutOfRange { id: PatternId, value: f64 },

    #[error("pattern id {id} does not match its content (expected {expected})")]
    IdMismatch { id: PatternId, expected: PatternId },

    #[error("duplicate pattern id {0}")]
    Duplicate(PatternId),
}

/// Which detection pass a matcher belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Structural,
    Textual,
}

/// Compiled matcher expression
#[derive(Debug, Clone)]
pub enum Matcher {
    /// `text:<regex>`
    Text(Regex),
    /// `field:<path-regex>=<value-regex>`; path is anchored, value is searched
    Field { path: Regex, value: Regex },
    /// `missing:<section>[<type-regex>].<key>`
    Missing {
        section: Section,
        kind: Regex,
        key: String,
    },
    /// `empty:<section>`
    Empty(Section),
    /// `duplicate:<section>.<key>`
    Duplicate { section: Section, key: String },
    /// `unresolved-variable`
    UnresolvedVariable,
}

impl Matcher {
    /// Compile an expression
    ///
    /// # Errors
    /// [`PatternError::InvalidExpression`] for unknown forms,
    /// [`PatternError::InvalidRegex`] for bad regexes.
    pub fn compile(expression: &str) -> Result<Self, PatternError> {
        let invalid = |reason: &str| PatternError::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };
        let regex = |re: &str| {
            Regex::new(re).map_err(|source| PatternError::InvalidRegex {
                expression: expression.to_string(),
                source,
            })
        };
        let section = |name: &str| Section::parse(name).ok_or_else(|| invalid("unknown section"));

        if expression == "unresolved-variable" {
            return Ok(Matcher::UnresolvedVariable);
        }
        let (form, body) = expression
            .split_once(':')
            .ok_or_else(|| invalid("missing `<form>:` prefix"))?;
        if body.is_empty() {
            return Err(invalid("empty body"));
        }

        match form {
            "text" => Ok(Matcher::Text(regex(body)?)),
            "field" => {
                let (path, value) = body
                    .split_once('=')
                    .ok_or_else(|| invalid("expected `<path>=<value>`"))?;
                if path.is_empty() {
                    return Err(invalid("empty path regex"));
                }
                Ok(Matcher::Field {
                    path: regex(&format!("^(?:{path})$"))?,
                    value: regex(value)?,
                })
            }
            "missing" => {
                let open = body.find('[').ok_or_else(|| invalid("expected `[<type>]`"))?;
                let close = body.rfind("].").ok_or_else(|| invalid("expected `].<key>`"))?;
                if close < open {
                    return Err(invalid("unbalanced brackets"));
                }
                let key = &body[close + 2..];
                if key.is_empty() {
                    return Err(invalid("empty key"));
                }
                Ok(Matcher::Missing {
                    section: section(&body[..open])?,
                    kind: regex(&format!("^(?:{})$", &body[open + 1..close]))?,
                    key: key.to_string(),
                })
            }
            "empty" => Ok(Matcher::Empty(section(body)?)),
            "duplicate" => {
                let (name, key) = body
                    .split_once('.')
                    .ok_or_else(|| invalid("expected `<section>.<key>`"))?;
                if key.is_empty() {
                    return Err(invalid("empty key"));
                }
                Ok(Matcher::Duplicate {
                    section: section(name)?,
                    key: key.to_string(),
                })
            }
            _ => Err(invalid("unknown form")),
        }
    }

    #[inline]
    #[must_use]
    pub fn pass(&self) -> Pass {
        match self {
            Matcher::Text(_) => Pass::Textual,
            _ => Pass::Structural,
        }
    }
}

/// A pattern paired with its compiled matcher
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub pattern: DelusionPattern,
    pub matcher: Matcher,
}

impl CompiledPattern {
    /// Validate and compile a pattern
    ///
    /// # Errors
    /// Any [`PatternError`] from validation or compilation.
    pub fn compile(pattern: DelusionPattern) -> Result<Self, PatternError> {
        pattern.validate()?;
        let matcher = Matcher::compile(&pattern.pattern)?;
        Ok(Self { pattern, matcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_and_short() {
        let a = PatternId::derive(PatternKind::Security, "text:foo");
        let b = PatternId::derive(PatternKind::Security, "text:foo");
        let c = PatternId::derive(PatternKind::Syntax, "text:foo");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 16);
        assert_eq!(PatternId::parse(a.as_str()), Some(a));
        assert_eq!(PatternId::parse("xyz"), None);
    }

    #[test]
    fn severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::High.is_blocking());
        assert!(!Severity::Medium.is_blocking());
    }

    #[test]
    fn compiles_every_form() {
        assert!(matches!(Matcher::compile("text:a+b").unwrap(), Matcher::Text(_)));
        assert!(matches!(
            Matcher::compile(r"field:.*\.password=.+").unwrap(),
            Matcher::Field { .. }
        ));
        match Matcher::compile("missing:builders[amazon-(ebs|chroot)].ami_name").unwrap() {
            Matcher::Missing { section, kind, key } => {
                assert_eq!(section, Section::Builders);
                assert!(kind.is_match("amazon-ebs"));
                assert!(!kind.is_match("amazon-ebs-x"));
                assert_eq!(key, "ami_name");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            Matcher::compile("empty:post-processors").unwrap(),
            Matcher::Empty(Section::PostProcessors)
        ));
        assert!(matches!(
            Matcher::compile("duplicate:builders.name").unwrap(),
            Matcher::Duplicate { .. }
        ));
        assert_eq!(
            Matcher::compile("unresolved-variable").unwrap().pass(),
            Pass::Structural
        );
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(matches!(
            Matcher::compile("nope"),
            Err(PatternError::InvalidExpression { .. })
        ));
        assert!(matches!(
            Matcher::compile("text:(unclosed"),
            Err(PatternError::InvalidRegex { .. })
        ));
        assert!(Matcher::compile("empty:volumes").is_err());
        assert!(Matcher::compile("missing:builders.ami").is_err());
        assert!(Matcher::compile("duplicate:builders.").is_err());
    }

    #[test]
    fn field_path_is_anchored() {
        let Matcher::Field { path, .. } = Matcher::compile(r"field:.*\.ssh_username=^root$").unwrap() else {
            panic!("expected field matcher");
        };
        assert!(path.is_match("builders[0].ssh_username"));
        assert!(!path.is_match("builders[0].ssh_username_x"));
    }

    #[test]
    fn validate_catches_bad_confidence_and_id() {
        let mut p = DelusionPattern::new(PatternKind::Build, Severity::Low, "text:x", "d", "r", 0.5);
        assert!(p.validate().is_ok());
        p.confidence = 1.5;
        assert!(matches!(p.validate(), Err(PatternError::ConfidenceOutOfRange { .. })));
        p.confidence = 0.5;
        p.pattern = "text:y".to_string();
        assert!(matches!(p.validate(), Err(PatternError::IdMismatch { .. })));
    }

    #[test]
    fn weights_default() {
        let w = SeverityWeights::default();
        assert!((w.weight(Severity::Critical) - 1.0).abs() < f64::EPSILON);
        assert!((w.weight(Severity::Low) - 0.35).abs() < f64::EPSILON);
    }
}
