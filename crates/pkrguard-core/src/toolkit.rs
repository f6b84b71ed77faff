//! Toolkit facade
//!
//! Wires the pattern store, detector, recovery engine, validation agent and
//! learning loop from one set of settings.

use crate::error::ToolkitError;
use crate::settings::ToolkitSettings;
use pkrguard_config::{load, ConfigHash, Configuration};
use pkrguard_detector::{DelusionAnalysis, DelusionDetector, JsonlAuditLog};
use pkrguard_patterns::{LearningLoop, LearningStats, PatternSource, PatternStore};
use pkrguard_recovery::{Diagnosis, JsonlEscalationLog, RecoveryEngine, RecoveryError, RecoveryPlan};
use pkrguard_validation::{
    ArtifactCheck, BuildResult, Certificate, CertificateIssuer, CertificateStore, Dimension,
    MetricScores, ValidationAgent, ValidationError, ValidationReport,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Analysis of a file, possibly from the textual pass only
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub path: PathBuf,
    pub analysis: DelusionAnalysis,
    /// Why the structural pass was skipped, when it was
    pub fallback_reason: Option<String>,
    #[serde(skip)]
    pub config: Option<Configuration>,
}

impl AnalysisOutcome {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Whether a certificate was issued
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Certification {
    Issued {
        certificate: Certificate,
    },
    Refused {
        overall: f64,
        threshold: f64,
        gap: f64,
        failing_dimensions: Vec<Dimension>,
        remediation_hints: Vec<String>,
    },
}

/// Validation of a file, with build evidence when supplied
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub report: ValidationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricScores>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactCheck>,
    pub certification: Certification,
}

impl ValidationOutcome {
    #[must_use]
    pub fn certificate(&self) -> Option<&Certificate> {
        match &self.certification {
            Certification::Issued { certificate } => Some(certificate),
            Certification::Refused { .. } => None,
        }
    }
}

/// Diagnosis of a build log with the plan that would run
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisOutcome {
    pub diagnosis: Diagnosis,
    pub plan: Option<RecoveryPlan>,
    /// Why no plan applies; the failure needs a human
    pub escalation: Option<String>,
}

/// Every component, built from one set of settings
#[derive(Debug)]
pub struct Toolkit {
    settings: ToolkitSettings,
    store: Arc<PatternStore>,
    detector: DelusionDetector,
    recovery: RecoveryEngine,
    validation: ValidationAgent,
    learning: Option<LearningLoop>,
}

impl Toolkit {
    /// Open the file-backed toolkit under the settings' state directory
    ///
    /// Starts the learning loop on the current runtime.
    ///
    /// # Errors
    /// Pattern store unavailable after retries, unusable signing key, or an
    /// unwritable state directory.
    pub async fn open(settings: ToolkitSettings) -> Result<Self, ToolkitError> {
        settings.validate()?;
        tokio::fs::create_dir_all(&settings.state_dir)
            .await
            .map_err(|e| ToolkitError::io(&settings.state_dir, e))?;

        let store = Arc::new(
            PatternStore::open_with_retry(
                settings.pattern_store_path(),
                settings.store_open_attempts,
                Duration::from_millis(settings.store_retry_base_ms),
            )
            .await?,
        );
        let issuer = CertificateIssuer::load_or_create(settings.signing_key_path())?
            .with_ttl(settings.certificate_ttl_secs);
        let certificates = CertificateStore::open(settings.certificate_dir_path())?;

        let detector = DelusionDetector::with_config(
            Arc::clone(&store) as Arc<dyn PatternSource>,
            settings.detector_config(),
        )
        .with_audit(Arc::new(JsonlAuditLog::new(settings.audit_log_path())));
        let learning = LearningLoop::spawn(Arc::clone(&store));
        let recovery = RecoveryEngine::new(detector.clone(), Arc::clone(&store))
            .with_escalation(Arc::new(JsonlEscalationLog::new(settings.escalation_log_path())))
            .with_learning(learning.handle())
            .with_backoff(Duration::from_millis(settings.recovery_backoff_ms));
        let validation = ValidationAgent::new(detector.clone(), issuer)
            .with_store(certificates)
            .with_threshold(settings.certification_threshold)
            .with_timeout(Duration::from_millis(settings.validation_timeout_ms));

        info!(
            state_dir = %settings.state_dir.display(),
            store_version = store.version(),
            "toolkit opened"
        );
        Ok(Self {
            settings,
            store,
            detector,
            recovery,
            validation,
            learning: Some(learning),
        })
    }

    /// Toolkit with the built-in catalog, an ephemeral key and no files
    ///
    /// # Errors
    /// Invalid settings.
    pub fn in_memory(settings: ToolkitSettings) -> Result<Self, ToolkitError> {
        settings.validate()?;
        let store = Arc::new(PatternStore::builtin()?);
        let detector = DelusionDetector::with_config(
            Arc::clone(&store) as Arc<dyn PatternSource>,
            settings.detector_config(),
        );
        let recovery = RecoveryEngine::new(detector.clone(), Arc::clone(&store))
            .with_backoff(Duration::from_millis(settings.recovery_backoff_ms));
        let validation = ValidationAgent::new(
            detector.clone(),
            CertificateIssuer::ephemeral().with_ttl(settings.certificate_ttl_secs),
        )
        .with_threshold(settings.certification_threshold)
        .with_timeout(Duration::from_millis(settings.validation_timeout_ms));
        Ok(Self {
            settings,
            store,
            detector,
            recovery,
            validation,
            learning: None,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &ToolkitSettings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    #[must_use]
    pub fn detector(&self) -> &DelusionDetector {
        &self.detector
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    #[must_use]
    pub fn validation(&self) -> &ValidationAgent {
        &self.validation
    }

    /// Load a configuration file off the async runtime
    ///
    /// # Errors
    /// Any [`ParseError`].
    pub async fn load_configuration(&self, path: &Path) -> Result<Configuration, ToolkitError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || load(owned))
            .await
            .map_err(|e| ToolkitError::io(path, std::io::Error::other(e.to_string())))?
            .map_err(ToolkitError::from)
    }

    /// Analyse a file, falling back to the textual pass when it cannot be
    /// parsed or normalized
    ///
    /// # Errors
    /// Unreadable file, store unavailable, timeouts, oversized input.
    pub async fn analyze_path(&self, path: &Path) -> Result<AnalysisOutcome, ToolkitError> {
        let origin = path.display().to_string();
        let failure: ToolkitError = match self.load_configuration(path).await {
            Ok(config) => match self.detector.analyze_configuration(&config).await {
                Ok(analysis) => {
                    return Ok(AnalysisOutcome {
                        path: path.to_path_buf(),
                        analysis,
                        fallback_reason: None,
                        config: Some(config),
                    })
                }
                Err(e) => e.into(),
            },
            Err(e) => e,
        };
        if !failure.allows_textual_fallback() {
            return Err(failure);
        }

        warn!(path = %origin, error = %failure, "structural analysis unavailable, using textual pass");
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolkitError::io(path, e))?;
        let analysis = self.detector.analyze_text(&origin, &raw)?;
        Ok(AnalysisOutcome {
            path: path.to_path_buf(),
            analysis,
            fallback_reason: Some(failure.to_string()),
            config: None,
        })
    }

    /// Validate a configuration and certify it when it passes
    ///
    /// Refusal is part of the outcome, not an error.
    ///
    /// # Errors
    /// Analysis or build-check failures, or a certificate that cannot be
    /// persisted.
    pub async fn certify(
        &self,
        config: &Configuration,
        build: Option<(&BuildResult, Option<&Path>)>,
    ) -> Result<ValidationOutcome, ToolkitError> {
        let (report, metrics, artifacts) = match build {
            Some((build, artifact_dir)) => {
                let multi = self
                    .validation
                    .perform_multi_dimensional_check(config, build, artifact_dir)
                    .await?;
                (multi.report, Some(multi.metrics), multi.artifacts)
            }
            None => (self.validation.validate_configuration(config).await?, None, Vec::new()),
        };

        let certification = match self.validation.create_validation_certificate(&report) {
            Ok(certificate) => Certification::Issued { certificate },
            Err(ValidationError::InsufficientConfidence {
                overall,
                threshold,
                gap,
                failing_dimensions,
                remediation_hints,
            }) => Certification::Refused {
                overall,
                threshold,
                gap,
                failing_dimensions,
                remediation_hints,
            },
            Err(e) => return Err(e.into()),
        };
        Ok(ValidationOutcome {
            report,
            metrics,
            artifacts,
            certification,
        })
    }

    /// Diagnose a build log and show the plan that would run
    ///
    /// The configuration is only read, and a missing plan is reported
    /// rather than escalated.
    ///
    /// # Errors
    /// A configuration path that cannot be read at all.
    pub async fn diagnose(
        &self,
        build_log: &str,
        config_path: Option<&Path>,
    ) -> Result<DiagnosisOutcome, ToolkitError> {
        let (config, hash) = match config_path {
            Some(path) => match self.load_configuration(path).await {
                Ok(config) => {
                    let hash = config.hash();
                    (Some(config), hash)
                }
                Err(e) if e.allows_textual_fallback() => {
                    warn!(path = %path.display(), error = %e, "diagnosing without configuration analysis");
                    let raw = tokio::fs::read(path)
                        .await
                        .map_err(|err| ToolkitError::io(path, err))?;
                    (None, ConfigHash::compute(&raw))
                }
                Err(e) => return Err(e),
            },
            None => (None, ConfigHash::compute(build_log.as_bytes())),
        };

        let diagnosis = self.recovery.diagnose_failure(build_log, config.as_ref()).await;
        let (plan, escalation) = match self.recovery.propose_plan(&diagnosis, hash) {
            Ok(plan) => (Some(plan), None),
            Err(RecoveryError::NoPlan { reason }) => (None, Some(reason)),
            Err(e) => return Err(e.into()),
        };
        Ok(DiagnosisOutcome {
            diagnosis,
            plan,
            escalation,
        })
    }

    /// Drain the learning loop and flush the store
    ///
    /// Engines cloned out of the toolkit may outlive it; their learning
    /// submissions fail once the loop has closed.
    ///
    /// # Errors
    /// A failed learning lane or flush.
    pub async fn shutdown(self) -> Result<Option<LearningStats>, ToolkitError> {
        let Self {
            store,
            recovery,
            learning,
            ..
        } = self;
        drop(recovery);
        let stats = match learning {
            Some(learning) => Some(learning.drain().await?),
            None => None,
        };
        store.flush()?;
        info!("toolkit shut down");
        Ok(stats)
    }
}
