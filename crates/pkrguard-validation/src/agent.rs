//! The validation agent

use crate::certificate::{Certificate, CertificateIssuer};
use crate::error::ValidationError;
use crate::hints::performance_hints;
use crate::metrics::{score_metrics, verify_artifacts, BuildResult, MetricBaseline, CHECKSUM_PENALTY};
use crate::report::{MultiDimReport, OptimizationReport, ValidationReport};
use crate::scoring::{generate_confidence_score, score_analysis, static_performance, Dimension, DimensionScores};
use crate::store::CertificateStore;
use chrono::Utc;
use pkrguard_config::{ConfigHash, Configuration};
use pkrguard_detector::DelusionDetector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Overall and per-dimension score a certificate requires
pub const DEFAULT_THRESHOLD: f64 = 0.7;

/// Scores configurations and builds, and issues certificates
#[derive(Debug, Clone)]
pub struct ValidationAgent {
    detector: DelusionDetector,
    issuer: Arc<CertificateIssuer>,
    certificates: Option<CertificateStore>,
    threshold: f64,
    baseline: MetricBaseline,
    timeout: Duration,
}

impl ValidationAgent {
    #[must_use]
    pub fn new(detector: DelusionDetector, issuer: CertificateIssuer) -> Self {
        Self {
            detector,
            issuer: Arc::new(issuer),
            certificates: None,
            threshold: DEFAULT_THRESHOLD,
            baseline: MetricBaseline::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Persist issued certificates
    #[must_use]
    pub fn with_store(mut self, store: CertificateStore) -> Self {
        self.certificates = Some(store);
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_baseline(mut self, baseline: MetricBaseline) -> Self {
        self.baseline = baseline;
        self
    }

    /// Bound on the build evidence checks
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    #[must_use]
    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    #[must_use]
    pub fn store(&self) -> Option<&CertificateStore> {
        self.certificates.as_ref()
    }

    /// Score a configuration without build evidence
    ///
    /// # Errors
    /// Whatever the detector reports for this configuration.
    pub async fn validate_configuration(
        &self,
        config: &Configuration,
    ) -> Result<ValidationReport, ValidationError> {
        let analysis = self.detector.analyze_configuration(config).await?;
        let hints = performance_hints(config);
        let dimensions = score_analysis(&analysis, hints.len());
        let report = ValidationReport::new(&analysis, dimensions, hints);
        info!(
            config = %report.config_hash.short(),
            overall = report.overall,
            findings = report.findings.len(),
            hints = report.hints.len(),
            "configuration validated"
        );
        Ok(report)
    }

    /// Score a configuration together with a finished build
    ///
    /// A failed build zeroes functionality and every artifact whose checksum
    /// does not match costs [`CHECKSUM_PENALTY`]. Performance becomes the mean
    /// of the static score and the build metrics. Relative artifact paths
    /// resolve against `artifact_dir`.
    ///
    /// # Errors
    /// - [`ValidationError::Timeout`] if the build checks exceed the bound
    /// - Detector errors from the static pass
    pub async fn perform_multi_dimensional_check(
        &self,
        config: &Configuration,
        build: &BuildResult,
        artifact_dir: Option<&Path>,
    ) -> Result<MultiDimReport, ValidationError> {
        let mut report = self.validate_configuration(config).await?;

        let owned = build.clone();
        let base: Option<PathBuf> = artifact_dir.map(Path::to_path_buf);
        let baseline = self.baseline;
        let task = tokio::task::spawn_blocking(move || {
            let artifacts = verify_artifacts(&owned.artifacts, base.as_deref());
            (score_metrics(&owned, &baseline), artifacts)
        });
        let (metrics, artifacts) = tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| ValidationError::Timeout(self.timeout))?
            .map_err(|e| ValidationError::Task(e.to_string()))?;

        let mut dimensions = report.dimensions;
        let mismatches = artifacts.iter().filter(|a| !a.matches).count();
        let functionality = if build.success {
            #[allow(clippy::cast_precision_loss)]
            let penalty = CHECKSUM_PENALTY * mismatches as f64;
            dimensions.functionality - penalty
        } else {
            0.0
        };
        dimensions.set(Dimension::Functionality, functionality);
        dimensions.set(
            Dimension::Performance,
            (dimensions.performance + metrics.overall) / 2.0,
        );
        report.rescore(dimensions);

        if !build.success {
            report
                .remediation_hints
                .insert(0, "[build] the build failed; fix it before certifying".to_string());
        }
        for check in artifacts.iter().filter(|a| !a.matches) {
            report.remediation_hints.push(format!(
                "[artifact] {} does not match its recorded checksum",
                check.path.display()
            ));
        }

        info!(
            config = %report.config_hash.short(),
            overall = report.overall,
            build_succeeded = build.success,
            mismatches,
            "multi-dimensional check complete"
        );
        Ok(MultiDimReport {
            report,
            metrics,
            artifacts,
            build_succeeded: build.success,
        })
    }

    #[must_use]
    pub fn generate_confidence_score(&self, dimensions: &DimensionScores) -> f64 {
        generate_confidence_score(dimensions)
    }

    /// Sign a certificate for a report that meets the threshold
    ///
    /// The certificate is also written to the store when one is attached.
    ///
    /// # Errors
    /// - [`ValidationError::InsufficientConfidence`] if the overall score or
    ///   any dimension is below the threshold
    /// - I/O errors persisting the certificate
    pub fn create_validation_certificate(
        &self,
        report: &ValidationReport,
    ) -> Result<Certificate, ValidationError> {
        let failing = report.failing_dimensions(self.threshold);
        if report.overall < self.threshold || !failing.is_empty() {
            let gap = failing
                .iter()
                .map(|d| self.threshold - report.dimensions.get(*d))
                .fold(self.threshold - report.overall, f64::max)
                .max(0.0);
            warn!(
                config = %report.config_hash.short(),
                overall = report.overall,
                ?failing,
                "certificate refused"
            );
            return Err(ValidationError::InsufficientConfidence {
                overall: report.overall,
                threshold: self.threshold,
                gap,
                failing_dimensions: failing,
                remediation_hints: report.remediation_hints.clone(),
            });
        }

        let trail = vec![
            format!(
                "analysis: store v{}, {} finding(s), {} hint(s)",
                report.store_version,
                report.findings.len(),
                report.hints.len()
            ),
            format!(
                "scores: {}",
                report
                    .dimensions
                    .iter()
                    .map(|(d, s)| format!("{d}={s:.3}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            format!("threshold: {}", self.threshold),
        ];
        let certificate = self.issuer.issue(report, trail);
        if let Some(store) = &self.certificates {
            store.save(&certificate)?;
        }
        info!(
            config = %certificate.config_hash.short(),
            id = %certificate.id,
            expiry = %certificate.expiry,
            "certificate issued"
        );
        Ok(certificate)
    }

    /// Signed by this agent's key and not expired
    #[must_use]
    pub fn validate_certificate(&self, certificate: &Certificate) -> bool {
        let valid = certificate.is_valid_at(&self.issuer.verifying_key(), Utc::now());
        debug!(id = %certificate.id, valid, "certificate checked");
        valid
    }

    /// Check the stored certificate for a hash; missing counts as invalid
    ///
    /// # Errors
    /// I/O or decoding errors reading the store.
    pub fn validate_stored(&self, config_hash: &ConfigHash) -> Result<bool, ValidationError> {
        let Some(store) = &self.certificates else {
            return Ok(false);
        };
        Ok(store
            .load(config_hash)?
            .is_some_and(|c| self.validate_certificate(&c)))
    }

    /// Performance hints and the static performance score
    #[must_use]
    pub fn optimize(&self, config: &Configuration) -> OptimizationReport {
        let hints = performance_hints(config);
        OptimizationReport {
            config_hash: config.hash(),
            performance: static_performance(hints.len()),
            hints,
        }
    }
}
