//! Build failure diagnosis
//!
//! Each line of a build log is matched against a table of failure
//! signatures. Later lines weigh more: Packer prints the fatal error last,
//! after whatever noise led up to it.

use pkrguard_detector::DelusionAnalysis;
use pkrguard_patterns::{builtin, DelusionPattern, PatternId, PatternKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

/// Broad class of build failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Connectivity,
    MissingDependency,
    Permission,
    Syntax,
    Resource,
    /// No signature matched
    Unknown,
}

impl FailureType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::MissingDependency => "missing_dependency",
            Self::Permission => "permission",
            Self::Syntax => "syntax",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }

    fn recommendations(self) -> &'static [&'static str] {
        match self {
            Self::Connectivity => &[
                "Retry the build; transient network failures often clear on their own",
                "Raise ssh_timeout/winrm_timeout so slow instances can finish booting",
                "Check security groups and subnets allow the communicator port",
            ],
            Self::MissingDependency => &[
                "Install the missing package in an earlier provisioner",
                "Refresh package indexes before installing (apt-get update)",
            ],
            Self::Permission => &[
                "Run privileged commands through sudo or execute_command",
                "Check IAM permissions of the credentials used by the builder",
            ],
            Self::Syntax => &[
                "Fix the template syntax and run `packer validate`",
                "Check every {{user `name`}} reference is declared",
            ],
            Self::Resource => &[
                "Pick another instance type or availability zone",
                "Free disk space in the build cache",
            ],
            Self::Unknown => &["Inspect the full build log; no known failure signature matched"],
        }
    }

    /// Whether a detected pattern is a plausible cause of this failure
    fn correlates(self, pattern: &DelusionPattern) -> bool {
        let expr = pattern.pattern.as_str();
        match self {
            Self::Connectivity => {
                expr == builtin::SHORT_COMMUNICATOR_TIMEOUT || expr == builtin::MISSING_SSH_TIMEOUT
            }
            Self::Permission => expr == builtin::ROOT_SSH_USER,
            Self::Syntax => pattern.kind == PatternKind::Syntax || expr == builtin::UNRESOLVED_VARIABLE,
            Self::MissingDependency => expr == builtin::REMOTE_SCRIPT_PIPE,
            Self::Resource | Self::Unknown => false,
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Signature {
    failure: FailureType,
    regex: Regex,
    weight: f64,
    root_cause: &'static str,
}

fn signature(failure: FailureType, expr: &str, weight: f64, root_cause: &'static str) -> Signature {
    Signature {
        failure,
        regex: Regex::new(expr).expect("hardcoded regex"),
        weight,
        root_cause,
    }
}

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    use FailureType::{Connectivity, MissingDependency, Permission, Resource, Syntax};
    vec![
        signature(
            Connectivity,
            r"(?i)(timeout waiting for (ssh|winrm)|(ssh|winrm)\s+(connection\s+)?time(d\s*)?out|connection timeout)",
            1.0,
            "SSH connection timeout: the communicator could not reach the instance before the timeout expired",
        ),
        signature(
            Connectivity,
            r"(?i)(connection refused|connection timed out|i/o timeout|no route to host|connection reset by peer)",
            0.8,
            "Network connection to the build instance failed",
        ),
        signature(
            Connectivity,
            r"(?i)(handshake failed|unable to authenticate)",
            0.6,
            "Communicator handshake failed",
        ),
        signature(
            MissingDependency,
            r"(?i)(command not found|executable file not found|unable to locate package|has no installation candidate|modulenotfounderror)",
            0.9,
            "A command or package required by a provisioner is not installed",
        ),
        signature(
            MissingDependency,
            r"(?i)no such file or directory",
            0.5,
            "A file expected by the build does not exist",
        ),
        signature(
            Permission,
            r"(?i)(permission denied|operation not permitted)",
            0.9,
            "A provisioner ran without the permissions it needs",
        ),
        signature(
            Permission,
            r"(?i)(unauthorizedoperation|accessdenied|access denied|not authorized to perform)",
            0.9,
            "Cloud credentials lack a required permission",
        ),
        signature(
            Syntax,
            r"(?i)(failed to parse template|error parsing|invalid character|unknown variable|template: .* unexpected)",
            0.95,
            "The template could not be parsed",
        ),
        signature(
            Resource,
            r"(?i)(insufficientinstancecapacity|instancelimitexceeded|vcpulimitexceeded|no space left on device|cannot allocate memory|out of memory)",
            0.9,
            "The build ran out of a resource (capacity, quota, disk or memory)",
        ),
    ]
});

static COMPONENT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:==>|-->)\s+([^\s:]+):").expect("hardcoded regex"));

static ERRORED_BUILD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Build '([^']+)' errored").expect("hardcoded regex"));

/// Confidence added per correlated configuration pattern
const CORRELATION_BOOST: f64 = 0.05;

/// A log line that matched a failure signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// 1-based line number in the log
    pub line_number: usize,
    pub line: String,
    pub failure_type: FailureType,
    /// Signature weight times position factor
    pub relevance: f64,
}

/// Result of diagnosing a build failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub failure_type: FailureType,
    pub root_cause: String,
    pub affected_components: Vec<String>,
    pub confidence: f64,
    /// Most relevant first
    pub evidence: Vec<Evidence>,
    pub recommendations: Vec<String>,
    pub correlated_patterns: Vec<PatternId>,
}

impl Diagnosis {
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.failure_type == FailureType::Unknown
    }
}

/// Later lines count more: the last line weighs 1.0, the first about 0.5
fn position_factor(index: usize, total: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let ratio = (index + 1) as f64 / total.max(1) as f64;
    0.5 + 0.5 * ratio
}

/// Diagnose a build log, optionally against the configuration's analysis
#[must_use]
pub fn diagnose(build_log: &str, analysis: Option<&DelusionAnalysis>) -> Diagnosis {
    let lines: Vec<&str> = build_log.lines().collect();
    let mut evidence = Vec::new();
    let mut causes: BTreeMap<FailureType, f64> = BTreeMap::new();
    let mut components = BTreeSet::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(c) = COMPONENT_PREFIX.captures(line).or_else(|| ERRORED_BUILD.captures(line)) {
            components.insert(c[1].to_string());
        }
        // One signature per line: the heaviest that matches
        let Some(sig) = SIGNATURES
            .iter()
            .filter(|s| s.regex.is_match(line))
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
        else {
            continue;
        };
        let relevance = sig.weight * position_factor(idx, lines.len());
        *causes.entry(sig.failure).or_insert(0.0) += relevance;
        evidence.push((relevance, sig.root_cause, Evidence {
            line_number: idx + 1,
            line: line.trim().to_string(),
            failure_type: sig.failure,
            relevance,
        }));
    }

    let total: f64 = causes.values().sum();
    let winner = causes
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(failure, sum)| (*failure, *sum));

    let Some((failure_type, winning_sum)) = winner else {
        return Diagnosis {
            failure_type: FailureType::Unknown,
            root_cause: "no known failure signature in the build log".to_string(),
            affected_components: components.into_iter().collect(),
            confidence: 0.0,
            evidence: Vec::new(),
            recommendations: FailureType::Unknown
                .recommendations()
                .iter()
                .map(ToString::to_string)
                .collect(),
            correlated_patterns: Vec::new(),
        };
    };

    // Root cause of the single most relevant line of the winning type
    let root_cause = evidence
        .iter()
        .filter(|(_, _, e)| e.failure_type == failure_type)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map_or("", |(_, cause, _)| *cause)
        .to_string();

    let mut evidence: Vec<Evidence> = evidence.into_iter().map(|(_, _, e)| e).collect();
    evidence.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then(a.line_number.cmp(&b.line_number))
    });

    let mut recommendations: Vec<String> = failure_type
        .recommendations()
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut correlated_patterns = Vec::new();
    if let Some(analysis) = analysis {
        for p in analysis.patterns.iter().filter(|p| failure_type.correlates(p)) {
            if !correlated_patterns.contains(&p.id) {
                correlated_patterns.push(p.id.clone());
                recommendations.push(p.remediation.clone());
            }
        }
    }

    let share = if total > 0.0 { winning_sum / total } else { 0.0 };
    #[allow(clippy::cast_precision_loss)]
    let boost = CORRELATION_BOOST * correlated_patterns.len() as f64;
    let confidence = (0.5 + 0.4 * share + boost).min(0.99);

    Diagnosis {
        failure_type,
        root_cause,
        affected_components: components.into_iter().collect(),
        confidence,
        evidence,
        recommendations,
        correlated_patterns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSH_LOG: &str = "\
==> web: Launching a source AWS instance...
==> web: Waiting for SSH to become available...
==> web: Timeout waiting for SSH.
Build 'web' errored after 5 minutes: Timeout waiting for SSH.
";

    #[test]
    fn ssh_timeout_is_connectivity() {
        let d = diagnose(SSH_LOG, None);
        assert_eq!(d.failure_type, FailureType::Connectivity);
        assert!(d.root_cause.to_lowercase().contains("timeout"));
        assert_eq!(d.affected_components, vec!["web".to_string()]);
        assert_eq!(d.evidence.len(), 2);
        assert_eq!(d.evidence[0].line_number, 4);
        assert!((d.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn ssh_connection_timeout_wording_is_connectivity() {
        let log = "==> web: SSH connection timeout\nBuild 'web' errored: SSH connection timeout";
        let d = diagnose(log, None);
        assert_eq!(d.failure_type, FailureType::Connectivity);
        assert!(d.root_cause.to_lowercase().contains("timeout"));
        assert_eq!(d.evidence.len(), 2);

        for line in ["WinRM timed out", "ssh: connection timeout", "SSH timeout after 5m"] {
            assert_eq!(diagnose(line, None).failure_type, FailureType::Connectivity, "{line}");
        }
    }

    #[test]
    fn empty_log_is_unknown() {
        let d = diagnose("", None);
        assert!(d.is_unknown());
        assert!(d.confidence.abs() < f64::EPSILON);
        assert!(d.evidence.is_empty());
        assert!(!d.recommendations.is_empty());
    }

    #[test]
    fn later_lines_outweigh_earlier_ones() {
        let log = "permission denied\nok\nok\nok\nok\nok\nok\nok\nok\ncommand not found";
        let d = diagnose(log, None);
        assert_eq!(d.failure_type, FailureType::MissingDependency);
        assert!(d.evidence[0].relevance > d.evidence[1].relevance);
    }

    #[test]
    fn summed_relevance_picks_the_winner() {
        let log = "Permission denied\nPermission denied\nPermission denied\nconnection refused";
        let d = diagnose(log, None);
        assert_eq!(d.failure_type, FailureType::Permission);
        assert!(d.confidence < 0.9);
    }

    #[test]
    fn components_come_from_prefixes_and_errored_builds() {
        let log = "==> amazon-ebs.web: step\n--> docker: failed\nBuild 'qemu' errored: no space left on device";
        let d = diagnose(log, None);
        assert_eq!(d.affected_components, vec!["amazon-ebs.web", "docker", "qemu"]);
        assert_eq!(d.failure_type, FailureType::Resource);
    }

    #[test]
    fn position_factor_is_bounded() {
        assert!((position_factor(9, 10) - 1.0).abs() < f64::EPSILON);
        assert!(position_factor(0, 10) > 0.5);
        assert!((position_factor(0, 0) - 1.0).abs() < f64::EPSILON);
    }
}
