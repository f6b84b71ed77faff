//! Recovery engine
//!
//! Drives one attempt through the state machine:
//!
//! ```text
//! DIAGNOSED -> PLANNED -> EXECUTING -> VALIDATING -> COMMITTED
//!     |           |           |            |
//!     +-----------+-----------+------------+--> ESCALATED / ROLLED_BACK
//! ```
//!
//! Only one attempt per configuration hash runs at a time, and only one per
//! configuration file however its contents hash.

use crate::cancel::CancelSignal;
use crate::diagnosis::{diagnose, Diagnosis};
use crate::error::{RecoveryError, StepError};
use crate::escalation::{Escalation, EscalationSink, TracingEscalation};
use crate::executor::{Backup, FileStepExecutor, RecoveryTarget, StepExecutor};
use crate::plan::{build_plan, RecoveryPlan, RecoveryStep, RollbackAction, TemplateRegistry, IRREVERSIBLE_CONFIDENCE};
use crate::result::{compare_analyses, AppliedFix, LearningData, Outcome, RecoveryResult, RecoveryValidation};
use crate::state_machine::{Attempt, RecoveryState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pkrguard_config::{load, ConfigHash, Configuration};
use pkrguard_detector::{DelusionAnalysis, DelusionDetector};
use pkrguard_patterns::{apply_event, Feedback, LearningEvent, LearningHandle, PatternStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a lease excludes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LeaseKey {
    Config(ConfigHash),
    Target(PathBuf),
}

impl LeaseKey {
    fn target(path: &Path) -> Self {
        let resolved = std::fs::canonicalize(path)
            .or_else(|_| std::path::absolute(path))
            .unwrap_or_else(|_| path.to_path_buf());
        Self::Target(resolved)
    }
}

/// Exclusive claim on a configuration hash and the file it lives in, released on drop
struct Lease {
    leases: Arc<DashMap<LeaseKey, String>>,
    keys: Vec<LeaseKey>,
}

impl Lease {
    fn acquire(
        leases: &Arc<DashMap<LeaseKey, String>>,
        config_hash: ConfigHash,
        target: &Path,
        plan_id: &str,
    ) -> Result<Self, RecoveryError> {
        let mut lease = Self {
            leases: Arc::clone(leases),
            keys: Vec::with_capacity(2),
        };
        for key in [LeaseKey::Config(config_hash), LeaseKey::target(target)] {
            // The entry guard must be gone before a partial lease drops
            let taken = match leases.entry(key.clone()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(plan_id.to_string());
                    false
                }
            };
            if taken {
                return Err(RecoveryError::RecoveryInProgress(config_hash));
            }
            lease.keys.push(key);
        }
        Ok(lease)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        for key in &self.keys {
            self.leases.remove(key);
        }
    }
}

/// Progress of an attempt that has started executing
struct Run {
    attempt: Attempt,
    started: Instant,
    backups: Vec<Backup>,
    fixes: Vec<AppliedFix>,
}

/// The recovery engine
#[derive(Clone)]
pub struct RecoveryEngine {
    detector: DelusionDetector,
    store: Arc<PatternStore>,
    registry: TemplateRegistry,
    executor: Arc<dyn StepExecutor>,
    escalation: Arc<dyn EscalationSink>,
    learning: Option<LearningHandle>,
    leases: Arc<DashMap<LeaseKey, String>>,
    backoff: Duration,
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("templates", &self.registry.len())
            .field("escalation", &self.escalation)
            .field("active_leases", &self.leases.len())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RecoveryEngine {
    /// Engine with built-in templates, the file executor, and tracing escalation
    #[must_use]
    pub fn new(detector: DelusionDetector, store: Arc<PatternStore>) -> Self {
        Self {
            detector,
            store,
            registry: TemplateRegistry::builtin(),
            executor: Arc::new(FileStepExecutor),
            escalation: Arc::new(TracingEscalation),
            learning: None,
            leases: Arc::new(DashMap::new()),
            backoff: Duration::from_millis(250),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: TemplateRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_escalation(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = sink;
        self
    }

    /// Route learning events through a running feedback loop
    #[must_use]
    pub fn with_learning(mut self, handle: LearningHandle) -> Self {
        self.learning = Some(handle);
        self
    }

    /// Base delay between step retries; doubles per retry
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Whether a recovery currently holds the lease for `config_hash`
    #[must_use]
    pub fn is_recovering(&self, config_hash: &ConfigHash) -> bool {
        self.leases.contains_key(&LeaseKey::Config(*config_hash))
    }

    /// Diagnose a build log
    ///
    /// With a configuration, its analysis is cross-referenced; analysis
    /// failures only drop the correlation.
    pub async fn diagnose_failure(&self, build_log: &str, config: Option<&Configuration>) -> Diagnosis {
        let analysis = match config {
            Some(config) => match self.detector.analyze_configuration(config).await {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(error = %e, "diagnosing without configuration analysis");
                    None
                }
            },
            None => None,
        };
        let diagnosis = diagnose(build_log, analysis.as_ref());
        info!(
            failure = %diagnosis.failure_type,
            confidence = diagnosis.confidence,
            evidence = diagnosis.evidence.len(),
            correlated = diagnosis.correlated_patterns.len(),
            "build failure diagnosed"
        );
        diagnosis
    }

    /// Build a plan for a diagnosis
    ///
    /// # Errors
    /// [`RecoveryError::NoPlan`] (escalated) or [`RecoveryError::MissingRollback`].
    pub fn generate_recovery_plan(
        &self,
        diagnosis: &Diagnosis,
        config_hash: ConfigHash,
    ) -> Result<RecoveryPlan, RecoveryError> {
        match self.propose_plan(diagnosis, config_hash) {
            Ok(plan) => {
                debug!(plan = %plan.id, template = %plan.template, steps = plan.steps.len(), "plan generated");
                Ok(plan)
            }
            Err(RecoveryError::NoPlan { reason }) => {
                let evidence = diagnosis.evidence.iter().map(|e| e.line.clone()).collect();
                self.escalation.escalate(
                    &Escalation::new(config_hash, RecoveryState::Diagnosed, reason.clone())
                        .with_evidence(evidence),
                );
                Err(RecoveryError::NoPlan { reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Plan for a diagnosis without escalating when none applies
    ///
    /// For previews that must leave no trace.
    ///
    /// # Errors
    /// As [`build_plan`].
    pub fn propose_plan(
        &self,
        diagnosis: &Diagnosis,
        config_hash: ConfigHash,
    ) -> Result<RecoveryPlan, RecoveryError> {
        build_plan(&self.registry, diagnosis, config_hash, |t| {
            self.store.is_template_flagged(t)
        })
    }

    /// Execute a plan against a target
    ///
    /// Failures after execution starts roll back and return a result with
    /// [`Outcome::RolledBack`]; only a failed rollback is an error.
    ///
    /// # Errors
    /// - [`RecoveryError::RecoveryInProgress`] if another attempt holds the
    ///   configuration hash or the target file
    /// - [`RecoveryError::MissingRollback`] for a step without a rollback entry
    /// - [`RecoveryError::UnrecoverableState`] if rollback fails
    /// - analysis errors for the configuration before execution
    pub async fn execute_recovery(
        &self,
        plan: &RecoveryPlan,
        target: &RecoveryTarget,
        cancel: &CancelSignal,
    ) -> Result<RecoveryResult, RecoveryError> {
        let started = Instant::now();
        let _lease = Lease::acquire(&self.leases, plan.config_hash, &target.config_path, &plan.id)?;

        let mut attempt = Attempt::new();
        attempt.advance(RecoveryState::Planned)?;

        for (idx, step) in plan.steps.iter().enumerate() {
            if plan.rollback.get(&step.id).is_none() {
                return Err(RecoveryError::MissingRollback {
                    template: plan.template.clone(),
                    step: idx,
                });
            }
        }

        if !plan.may_run_automatically() {
            let reason = format!(
                "irreversible plan with confidence {:.2} below {IRREVERSIBLE_CONFIDENCE}",
                plan.confidence
            );
            return self.escalate(plan, attempt, started, reason, Vec::new());
        }

        info!(plan = %plan.id, template = %plan.template, steps = plan.steps.len(), "executing recovery");
        let before = self.analyze_target(&target.config_path).await?;

        attempt.advance(RecoveryState::Executing)?;
        let mut run = Run {
            attempt,
            started,
            backups: Vec::new(),
            fixes: Vec::new(),
        };

        for step in &plan.steps {
            if plan.rollback.get(&step.id) == Some(RollbackAction::RestoreSnapshot) {
                for path in self.executor.touched_paths(step, target) {
                    match Backup::capture(&step.id, &path) {
                        Ok(b) => run.backups.push(b),
                        Err(e) => return self.abort(plan, run, format!("snapshot failed: {e}")),
                    }
                }
            }
            match self.run_step(step, target, cancel).await {
                Ok((description, attempts)) => {
                    debug!(step = %step.id, attempts, "{description}");
                    run.fixes.push(AppliedFix {
                        step_id: step.id.clone(),
                        action: step.action.name().to_string(),
                        description,
                        attempts,
                    });
                }
                Err(reason) => return self.abort(plan, run, reason),
            }
        }

        run.attempt.advance(RecoveryState::Validating)?;
        let after = match self.analyze_target(&target.config_path).await {
            Ok(a) => a,
            Err(e) => return self.abort(plan, run, format!("post-recovery analysis failed: {e}")),
        };
        let validation = compare_analyses(&before, &after);
        let passed = if plan.modifies_config() {
            validation.success
        } else {
            validation.new_blocking.is_empty()
        };
        if !passed {
            let reason = format!(
                "validation failed: score {:.3} -> {:.3}, {} new blocking findings",
                validation.before_score,
                validation.after_score,
                validation.new_blocking.len()
            );
            return self.abort(plan, run, reason);
        }

        run.attempt.advance(RecoveryState::Committed)?;
        info!(plan = %plan.id, cleared = validation.cleared.len(), "recovery committed");
        Ok(self.result(plan, run, true, Outcome::Committed, Some(validation)))
    }

    /// Compare a configuration after recovery with the analysis from before
    ///
    /// # Errors
    /// Analysis errors for `after`.
    pub async fn validate_recovery(
        &self,
        before: &DelusionAnalysis,
        after: &Configuration,
    ) -> Result<RecoveryValidation, RecoveryError> {
        let after = self.detector.analyze_configuration(after).await?;
        Ok(compare_analyses(before, &after))
    }

    /// Undo a finished attempt, restoring every backup in reverse order
    ///
    /// # Errors
    /// [`RecoveryError::UnrecoverableState`] if a file cannot be restored.
    pub fn rollback(&self, result: &RecoveryResult) -> Result<usize, RecoveryError> {
        restore_all(&result.backups).map_err(|reason| {
            error!(plan = %result.plan_id, "rollback failed: {reason}");
            RecoveryError::UnrecoverableState {
                plan_id: result.plan_id.clone(),
                reason,
            }
        })?;
        info!(plan = %result.plan_id, restored = result.backups.len(), "recovery rolled back");
        Ok(result.backups.len())
    }

    /// Feed an attempt back into the pattern store
    ///
    /// Attempts escalated before anything ran teach nothing.
    ///
    /// # Errors
    /// A closed learning loop or store failure.
    pub fn learn_from_recovery(
        &self,
        result: &RecoveryResult,
        feedback: Option<Feedback>,
    ) -> Result<(), RecoveryError> {
        if result.is_escalated() && result.applied_fixes.is_empty() {
            debug!(plan = %result.plan_id, "nothing to learn from escalated attempt");
            return Ok(());
        }
        let event = LearningEvent::RecoveryOutcome {
            template: result.learning_data.template.clone(),
            success: result.success,
            cleared_patterns: result.learning_data.cleared_patterns.clone(),
            feedback,
        };
        match &self.learning {
            Some(handle) => handle.submit(result.config_hash, event)?,
            None => apply_event(&self.store, event)?,
        }
        Ok(())
    }

    /// Diagnose, plan, and execute in one call
    ///
    /// # Errors
    /// As [`generate_recovery_plan`](Self::generate_recovery_plan) and
    /// [`execute_recovery`](Self::execute_recovery).
    pub async fn recover(
        &self,
        build_log: &str,
        target: &RecoveryTarget,
        cancel: &CancelSignal,
    ) -> Result<RecoveryResult, RecoveryError> {
        let config = load(&target.config_path).ok();
        let hash = match &config {
            Some(c) => c.hash(),
            None => {
                let raw = tokio::fs::read(&target.config_path)
                    .await
                    .map_err(|e| RecoveryError::io(&target.config_path, e))?;
                ConfigHash::compute(&raw)
            }
        };
        let diagnosis = self.diagnose_failure(build_log, config.as_ref()).await;
        let plan = self.generate_recovery_plan(&diagnosis, hash)?;
        self.execute_recovery(&plan, target, cancel).await
    }

    async fn analyze_target(&self, path: &Path) -> Result<DelusionAnalysis, RecoveryError> {
        match load(path) {
            Ok(config) => Ok(self.detector.analyze_configuration(&config).await?),
            Err(e) if e.allows_textual_fallback() => {
                warn!(path = %path.display(), error = %e, "falling back to textual analysis");
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| RecoveryError::io(path, err))?;
                Ok(self.detector.analyze_text(&path.display().to_string(), &raw)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run a step with timeout and bounded retries
    ///
    /// Each attempt runs as its own task. A timed-out or cancelled attempt
    /// is still awaited to completion before the step retries or fails, so
    /// nothing it writes can land after a rollback.
    async fn run_step(
        &self,
        step: &RecoveryStep,
        target: &RecoveryTarget,
        cancel: &CancelSignal,
    ) -> Result<(String, u32), String> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let executor = Arc::clone(&self.executor);
            let (task_step, task_target) = (step.clone(), target.clone());
            let mut task = tokio::spawn(async move { executor.execute(&task_step, &task_target).await });
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                r = tokio::time::timeout(step.timeout(), &mut task) => Some(r),
            };
            let failure = match outcome {
                None => {
                    settle(step, task).await;
                    return Err("cancelled".to_string());
                }
                Some(Ok(Ok(Ok(description)))) => return Ok((description, attempts)),
                Some(Ok(Ok(Err(e)))) if !e.transient => return Err(format!("step {} failed: {e}", step.id)),
                Some(Ok(Ok(Err(e)))) => e.message,
                Some(Ok(Err(join))) => return Err(format!("step {} aborted: {join}", step.id)),
                Some(Err(_)) => {
                    settle(step, task).await;
                    format!("timed out after {}ms", step.timeout_ms)
                }
            };
            if attempts > step.retries {
                return Err(format!("step {} failed after {attempts} attempts: {failure}", step.id));
            }
            let delay = self.backoff * 2u32.saturating_pow(attempts.min(16) - 1);
            debug!(step = %step.id, attempts, ?delay, "retrying: {failure}");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err("cancelled".to_string()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Roll back completed steps after a failure
    fn abort(&self, plan: &RecoveryPlan, mut run: Run, reason: String) -> Result<RecoveryResult, RecoveryError> {
        warn!(plan = %plan.id, state = %run.attempt.state(), "rolling back: {reason}");
        if let Err(failure) = restore_all(&run.backups) {
            error!(plan = %plan.id, "rollback failed: {failure}");
            // Escalation is the only exit once a rollback fails
            let _ = run.attempt.advance(RecoveryState::Escalated);
            self.escalation.escalate(
                &Escalation::new(plan.config_hash, RecoveryState::RolledBack, format!("rollback failed: {failure}"))
                    .for_plan(&plan.id)
                    .with_evidence(vec![reason]),
            );
            return Err(RecoveryError::UnrecoverableState {
                plan_id: plan.id.clone(),
                reason: failure,
            });
        }
        run.attempt.advance(RecoveryState::RolledBack)?;
        Ok(self.result(plan, run, false, Outcome::RolledBack { reason }, None))
    }

    fn escalate(
        &self,
        plan: &RecoveryPlan,
        mut attempt: Attempt,
        started: Instant,
        reason: String,
        evidence: Vec<String>,
    ) -> Result<RecoveryResult, RecoveryError> {
        let from = attempt.state();
        attempt.advance(RecoveryState::Escalated)?;
        self.escalation.escalate(
            &Escalation::new(plan.config_hash, from, reason.clone())
                .for_plan(&plan.id)
                .with_evidence(evidence.clone()),
        );
        let run = Run {
            attempt,
            started,
            backups: Vec::new(),
            fixes: Vec::new(),
        };
        Ok(self.result(plan, run, false, Outcome::Escalated { reason, evidence }, None))
    }

    #[allow(clippy::unused_self)]
    fn result(
        &self,
        plan: &RecoveryPlan,
        run: Run,
        success: bool,
        outcome: Outcome,
        validation: Option<RecoveryValidation>,
    ) -> RecoveryResult {
        let confidence_improvement = validation
            .as_ref()
            .map_or(0.0, |v| v.before_score - v.after_score);
        let cleared_patterns = validation.as_ref().map(|v| v.cleared.clone()).unwrap_or_default();
        RecoveryResult {
            plan_id: plan.id.clone(),
            config_hash: plan.config_hash,
            success,
            outcome,
            applied_fixes: run.fixes,
            confidence_improvement,
            validation,
            rollback_plan: (!plan.rollback.is_empty()).then(|| plan.rollback.clone()),
            backups: run.backups,
            learning_data: LearningData {
                failure_type: plan.failure_type,
                template: plan.template.clone(),
                cleared_patterns,
                states: run.attempt.path(),
            },
            execution_time_ms: u64::try_from(run.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Wait out an attempt whose result no longer counts
async fn settle(step: &RecoveryStep, task: tokio::task::JoinHandle<Result<String, StepError>>) {
    match task.await {
        Ok(Ok(description)) => debug!(step = %step.id, "late attempt finished: {description}"),
        Ok(Err(e)) => debug!(step = %step.id, "late attempt failed: {e}"),
        Err(e) => warn!(step = %step.id, "late attempt aborted: {e}"),
    }
}

/// Restore backups newest first; stops at the first failure
fn restore_all(backups: &[Backup]) -> Result<(), String> {
    for backup in backups.iter().rev() {
        backup
            .restore()
            .map_err(|e| format!("{} ({}): {e}", backup.path.display(), backup.step_id))?;
    }
    Ok(())
}
