//! Recovery templates and plan construction

use crate::diagnosis::{Diagnosis, FailureType};
use crate::error::RecoveryError;
use pkrguard_config::ConfigHash;
use pkrguard_patterns::{builtin, PatternId, PatternKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

/// Plans below this confidence are never generated
pub const MIN_PLAN_CONFIDENCE: f64 = 0.5;

/// Irreversible plans below this confidence are escalated instead of run
pub const IRREVERSIBLE_CONFIDENCE: f64 = 0.9;

/// A remediation action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run the build later; touches nothing
    RetryWithBackoff { attempts: u32, base_delay_ms: u64 },
    /// Set a value at a JSON pointer in the configuration
    SetField {
        pointer: String,
        value: serde_json::Value,
    },
    /// Prepend an inline shell provisioner
    AddProvisioner { inline: Vec<String> },
    /// Raise every builder's ssh/winrm timeout to at least `minimum`
    RaiseCommunicatorTimeout { minimum: String },
    StripTrailingCommas,
    /// Delete a directory below the working directory
    PurgeDirectory { path: String },
}

impl RecoveryAction {
    /// Short name for logs and fix lists
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RetryWithBackoff { .. } => "retry_with_backoff",
            Self::SetField { .. } => "set_field",
            Self::AddProvisioner { .. } => "add_provisioner",
            Self::RaiseCommunicatorTimeout { .. } => "raise_communicator_timeout",
            Self::StripTrailingCommas => "strip_trailing_commas",
            Self::PurgeDirectory { .. } => "purge_directory",
        }
    }

    /// Whether the action rewrites the configuration file
    #[must_use]
    pub fn modifies_config(&self) -> bool {
        matches!(
            self,
            Self::SetField { .. }
                | Self::AddProvisioner { .. }
                | Self::RaiseCommunicatorTimeout { .. }
                | Self::StripTrailingCommas
        )
    }

    /// Counterpart used when a template leaves it out
    #[must_use]
    pub fn natural_rollback(&self) -> RollbackAction {
        match self {
            Self::RetryWithBackoff { .. } => RollbackAction::NoOp,
            Self::PurgeDirectory { .. } => RollbackAction::Irreversible,
            _ => RollbackAction::RestoreSnapshot,
        }
    }
}

/// How a step is undone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    NoOp,
    /// Restore the files snapshotted before the step
    RestoreSnapshot,
    Irreversible,
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub id: String,
    pub action: RecoveryAction,
    pub timeout_ms: u64,
    /// Extra attempts after the first
    pub retries: u32,
}

impl RecoveryStep {
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub step_id: String,
    pub action: RollbackAction,
}

/// One rollback step per recovery step, in the same order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn get(&self, step_id: &str) -> Option<RollbackAction> {
        self.steps.iter().find(|s| s.step_id == step_id).map(|s| s.action)
    }
}

/// An executable recovery plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub config_hash: ConfigHash,
    pub failure_type: FailureType,
    pub template: String,
    pub steps: Vec<RecoveryStep>,
    pub rollback: RollbackPlan,
    pub validation_checks: Vec<String>,
    pub irreversible: bool,
    pub confidence: f64,
}

impl RecoveryPlan {
    /// Whether the plan may run without a human
    #[must_use]
    pub fn may_run_automatically(&self) -> bool {
        !self.irreversible || self.confidence >= IRREVERSIBLE_CONFIDENCE
    }

    #[must_use]
    pub fn modifies_config(&self) -> bool {
        self.steps.iter().any(|s| s.action.modifies_config())
    }
}

/// Template step; `rollback: None` is rejected at plan time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub action: RecoveryAction,
    pub rollback: Option<RollbackAction>,
    pub timeout_ms: u64,
    pub retries: u32,
    /// Only planned when the diagnosis correlated one of these patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when_correlated: Vec<PatternId>,
}

impl StepTemplate {
    /// Step with the action's natural rollback
    #[must_use]
    pub fn new(action: RecoveryAction) -> Self {
        Self {
            rollback: Some(action.natural_rollback()),
            action,
            timeout_ms: 30_000,
            retries: 2,
            when_correlated: Vec::new(),
        }
    }

    #[must_use]
    pub fn when_correlated(mut self, patterns: impl IntoIterator<Item = PatternId>) -> Self {
        self.when_correlated = patterns.into_iter().collect();
        self
    }

    fn applies_to(&self, diagnosis: &Diagnosis) -> bool {
        self.when_correlated.is_empty()
            || self
                .when_correlated
                .iter()
                .any(|id| diagnosis.correlated_patterns.contains(id))
    }

    #[must_use]
    pub fn without_rollback(mut self) -> Self {
        self.rollback = None;
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTemplate {
    pub name: String,
    pub failure_type: FailureType,
    pub steps: Vec<StepTemplate>,
}

impl RecoveryTemplate {
    #[must_use]
    pub fn new(name: impl Into<String>, failure_type: FailureType, steps: Vec<StepTemplate>) -> Self {
        Self {
            name: name.into(),
            failure_type,
            steps,
        }
    }
}

/// Templates keyed by failure type
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<FailureType, RecoveryTemplate>,
}

impl TemplateRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Templates shipped with the toolkit
    ///
    /// Permission failures have none: fixing them means changing
    /// credentials or policies, which stays with a human.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(RecoveryTemplate::new(
            "retry-with-backoff",
            FailureType::Connectivity,
            vec![
                StepTemplate::new(RecoveryAction::RaiseCommunicatorTimeout {
                    minimum: DEFAULT_COMMUNICATOR_TIMEOUT.to_string(),
                })
                .when_correlated(communicator_timeout_patterns()),
                StepTemplate::new(RecoveryAction::RetryWithBackoff {
                    attempts: 3,
                    base_delay_ms: 1_000,
                }),
            ],
        ));
        registry.register(RecoveryTemplate::new(
            "refresh-package-index",
            FailureType::MissingDependency,
            vec![StepTemplate::new(RecoveryAction::AddProvisioner {
                inline: vec!["sudo apt-get update".to_string()],
            })],
        ));
        registry.register(RecoveryTemplate::new(
            "strip-trailing-commas",
            FailureType::Syntax,
            vec![StepTemplate::new(RecoveryAction::StripTrailingCommas)],
        ));
        registry.register(RecoveryTemplate::new(
            "purge-build-cache",
            FailureType::Resource,
            vec![StepTemplate::new(RecoveryAction::PurgeDirectory {
                path: "packer_cache".to_string(),
            })
            .retries(0)],
        ));
        registry
    }

    /// Add or replace the template for its failure type
    pub fn register(&mut self, template: RecoveryTemplate) -> Option<RecoveryTemplate> {
        self.templates.insert(template.failure_type, template)
    }

    #[must_use]
    pub fn get(&self, failure_type: FailureType) -> Option<&RecoveryTemplate> {
        self.templates.get(&failure_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Timeout the connectivity template raises short communicator timeouts to
pub const DEFAULT_COMMUNICATOR_TIMEOUT: &str = "10m";

/// Built-in patterns that blame the communicator timeout
fn communicator_timeout_patterns() -> [PatternId; 2] {
    [
        PatternId::derive(PatternKind::Build, builtin::SHORT_COMMUNICATOR_TIMEOUT),
        PatternId::derive(PatternKind::Build, builtin::MISSING_SSH_TIMEOUT),
    ]
}

/// Package and command names quoted by missing-dependency evidence
static MISSING_NAME: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)unable to locate package\s+([A-Za-z0-9][A-Za-z0-9.+_-]*)",
        r"(?i)package '?([A-Za-z0-9][A-Za-z0-9.+_-]*)'? has no installation candidate",
        r"([A-Za-z0-9][A-Za-z0-9.+_-]*): command not found",
        r#"exec: "([A-Za-z0-9][A-Za-z0-9.+_-]*)": executable file not found"#,
    ]
    .into_iter()
    .map(|expr| Regex::new(expr).expect("hardcoded regex"))
    .collect()
});

/// Names the evidence says are missing, most relevant first, deduplicated
///
/// The character class keeps anything shell-active out of the names.
#[must_use]
pub fn missing_packages(diagnosis: &Diagnosis) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for evidence in diagnosis
        .evidence
        .iter()
        .filter(|e| e.failure_type == FailureType::MissingDependency)
    {
        for regex in MISSING_NAME.iter() {
            for caps in regex.captures_iter(&evidence.line) {
                let name = caps[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

/// Fill a template action in from the diagnosis
fn parameterize(action: &RecoveryAction, diagnosis: &Diagnosis) -> RecoveryAction {
    match action {
        RecoveryAction::AddProvisioner { inline } if diagnosis.failure_type == FailureType::MissingDependency => {
            let packages = missing_packages(diagnosis);
            let mut inline = inline.clone();
            if !packages.is_empty() {
                inline.push(format!("sudo apt-get install -y {}", packages.join(" ")));
            }
            RecoveryAction::AddProvisioner { inline }
        }
        other => other.clone(),
    }
}

/// Build a plan from a diagnosis
///
/// Steps conditioned on correlated patterns are dropped when the diagnosis
/// has none of them; the rest are parameterized from the evidence.
///
/// `is_flagged` reports templates held for human review.
///
/// # Errors
/// - [`RecoveryError::NoPlan`] for unknown failures, missing or flagged
///   templates, or a diagnosis below [`MIN_PLAN_CONFIDENCE`]
/// - [`RecoveryError::MissingRollback`] if any step lacks a rollback
pub fn build_plan(
    registry: &TemplateRegistry,
    diagnosis: &Diagnosis,
    config_hash: ConfigHash,
    is_flagged: impl Fn(&str) -> bool,
) -> Result<RecoveryPlan, RecoveryError> {
    let no_plan = |reason: String| Err(RecoveryError::NoPlan { reason });

    if diagnosis.is_unknown() {
        return no_plan("failure type could not be determined".to_string());
    }
    if diagnosis.confidence < MIN_PLAN_CONFIDENCE {
        return no_plan(format!(
            "diagnosis confidence {:.2} below {MIN_PLAN_CONFIDENCE}",
            diagnosis.confidence
        ));
    }
    let Some(template) = registry.get(diagnosis.failure_type) else {
        return no_plan(format!("no template for {} failures", diagnosis.failure_type));
    };
    if is_flagged(&template.name) {
        return no_plan(format!("template `{}` is flagged for human review", template.name));
    }

    let mut steps = Vec::with_capacity(template.steps.len());
    let mut rollback = RollbackPlan::default();
    for (idx, step) in template.steps.iter().enumerate() {
        let action = step.rollback.ok_or_else(|| RecoveryError::MissingRollback {
            template: template.name.clone(),
            step: idx,
        })?;
        if !step.applies_to(diagnosis) {
            continue;
        }
        let id = format!("step-{}", steps.len() + 1);
        rollback.steps.push(RollbackStep {
            step_id: id.clone(),
            action,
        });
        steps.push(RecoveryStep {
            id,
            action: parameterize(&step.action, diagnosis),
            timeout_ms: step.timeout_ms,
            retries: step.retries,
        });
    }
    if steps.is_empty() {
        return no_plan(format!("template `{}` has no step for this diagnosis", template.name));
    }
    let irreversible = rollback.steps.iter().any(|s| s.action == RollbackAction::Irreversible);

    Ok(RecoveryPlan {
        id: uuid::Uuid::new_v4().to_string(),
        config_hash,
        failure_type: diagnosis.failure_type,
        template: template.name.clone(),
        steps,
        rollback,
        validation_checks: vec![
            "no new critical or high findings".to_string(),
            "delusion confidence strictly improves when the configuration changed".to_string(),
        ],
        irreversible,
        confidence: diagnosis.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::Evidence;

    fn diagnosis(failure_type: FailureType, confidence: f64) -> Diagnosis {
        Diagnosis {
            failure_type,
            root_cause: String::new(),
            affected_components: vec![],
            confidence,
            evidence: vec![],
            recommendations: vec![],
            correlated_patterns: vec![],
        }
    }

    fn plan(registry: &TemplateRegistry, d: &Diagnosis) -> Result<RecoveryPlan, RecoveryError> {
        build_plan(registry, d, ConfigHash::compute(b"cfg"), |_| false)
    }

    #[test]
    fn connectivity_plan_is_a_single_retry() {
        let p = plan(&TemplateRegistry::builtin(), &diagnosis(FailureType::Connectivity, 0.9)).unwrap();
        assert_eq!(p.steps.len(), 1);
        assert!(matches!(p.steps[0].action, RecoveryAction::RetryWithBackoff { .. }));
        assert_eq!(p.rollback.steps.len(), 1);
        assert_eq!(p.rollback.get("step-1"), Some(RollbackAction::NoOp));
        assert!(!p.irreversible);
        assert!(!p.modifies_config());
    }

    #[test]
    fn correlated_timeout_adds_a_timeout_step() {
        let mut d = diagnosis(FailureType::Connectivity, 0.95);
        d.correlated_patterns = vec![PatternId::derive(
            PatternKind::Build,
            builtin::SHORT_COMMUNICATOR_TIMEOUT,
        )];
        let p = plan(&TemplateRegistry::builtin(), &d).unwrap();
        assert_eq!(p.steps.len(), 2);
        assert_eq!(
            p.steps[0].action,
            RecoveryAction::RaiseCommunicatorTimeout {
                minimum: DEFAULT_COMMUNICATOR_TIMEOUT.to_string()
            }
        );
        assert_eq!(p.rollback.get("step-1"), Some(RollbackAction::RestoreSnapshot));
        assert!(matches!(p.steps[1].action, RecoveryAction::RetryWithBackoff { .. }));
        assert_eq!(p.rollback.get("step-2"), Some(RollbackAction::NoOp));
        assert!(p.modifies_config());
    }

    fn evidence(line: &str) -> Evidence {
        Evidence {
            line_number: 1,
            line: line.to_string(),
            failure_type: FailureType::MissingDependency,
            relevance: 0.9,
        }
    }

    #[test]
    fn missing_packages_come_from_the_evidence() {
        let registry = TemplateRegistry::builtin();
        let mut d = diagnosis(FailureType::MissingDependency, 0.9);
        let bare = plan(&registry, &d).unwrap();
        assert_eq!(
            bare.steps[0].action,
            RecoveryAction::AddProvisioner {
                inline: vec!["sudo apt-get update".to_string()]
            }
        );

        d.evidence = vec![
            evidence("==> web: E: Unable to locate package jq"),
            evidence("==> web: /tmp/script.sh: line 3: jq: command not found"),
            evidence("==> web: /tmp/script.sh: line 4: unzip: command not found"),
            evidence("==> web: rm -rf /; echo: command not found"),
        ];
        let p = plan(&registry, &d).unwrap();
        assert_eq!(
            p.steps[0].action,
            RecoveryAction::AddProvisioner {
                inline: vec![
                    "sudo apt-get update".to_string(),
                    "sudo apt-get install -y jq unzip echo".to_string(),
                ]
            }
        );
    }

    #[test]
    fn missing_rollback_fails_closed() {
        let mut registry = TemplateRegistry::empty();
        registry.register(RecoveryTemplate::new(
            "raise-timeout",
            FailureType::Connectivity,
            vec![StepTemplate::new(RecoveryAction::SetField {
                pointer: "/builders/0/ssh_timeout".into(),
                value: "10m".into(),
            })
            .without_rollback()],
        ));
        let err = plan(&registry, &diagnosis(FailureType::Connectivity, 0.9)).unwrap_err();
        assert!(matches!(err, RecoveryError::MissingRollback { step: 0, .. }));
    }

    #[test]
    fn no_plan_cases() {
        let registry = TemplateRegistry::builtin();
        for d in [
            diagnosis(FailureType::Unknown, 0.9),
            diagnosis(FailureType::Permission, 0.9),
            diagnosis(FailureType::Connectivity, 0.3),
        ] {
            assert!(matches!(plan(&registry, &d), Err(RecoveryError::NoPlan { .. })));
        }
        let flagged = build_plan(
            &registry,
            &diagnosis(FailureType::Connectivity, 0.9),
            ConfigHash::compute(b"cfg"),
            |t| t == "retry-with-backoff",
        );
        assert!(matches!(flagged, Err(RecoveryError::NoPlan { .. })));
    }

    #[test]
    fn purge_is_irreversible() {
        let p = plan(&TemplateRegistry::builtin(), &diagnosis(FailureType::Resource, 0.85)).unwrap();
        assert!(p.irreversible);
        assert!(!p.may_run_automatically());
        let sure = plan(&TemplateRegistry::builtin(), &diagnosis(FailureType::Resource, 0.95)).unwrap();
        assert!(sure.may_run_automatically());
    }

    #[test]
    fn plans_get_fresh_ids() {
        let registry = TemplateRegistry::builtin();
        let d = diagnosis(FailureType::Syntax, 0.9);
        assert_ne!(plan(&registry, &d).unwrap().id, plan(&registry, &d).unwrap().id);
    }
}
