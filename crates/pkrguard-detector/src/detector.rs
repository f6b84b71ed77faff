//! Delusion detector
//!
//! Analyses are CPU-bound and run on the blocking pool under a timeout.
//! Results are cached by `(config hash, store version)`; concurrent calls
//! for the same key share one computation.

use crate::analysis::{Coverage, DelusionAnalysis};
use crate::audit::{AuditRecord, AuditSink};
use crate::error::DetectorError;
use crate::matching::{section_sizes, structural_matches, textual_matches};
use chrono::Utc;
use moka::future::Cache;
use pkrguard_config::{normalize, ConfigHash, Configuration, ParseError};
use pkrguard_patterns::{
    Correction, CorrectionRecord, DelusionPattern, PatternId, PatternSnapshot, PatternSource,
    SeverityWeights,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Detector limits and weights
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Largest raw input analysed, in bytes
    pub max_input_bytes: usize,
    /// Bound on one analysis
    pub timeout: Duration,
    /// Cached analyses kept
    pub cache_capacity: u64,
    pub severity_weights: SeverityWeights,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 10 * 1024 * 1024, // 10MB
            timeout: Duration::from_secs(5),
            cache_capacity: 1_000,
            severity_weights: SeverityWeights::default(),
        }
    }
}

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    /// Analyses actually computed (cache misses that finished)
    pub computations: u64,
    pub cached_entries: u64,
}

/// Configuration hash, store version, and a digest of the located source
///
/// Two files with the same document but different text or names report
/// different locations, so they are cached apart.
type CacheKey = (ConfigHash, u64, ConfigHash);

fn source_digest(config: &Configuration) -> ConfigHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(config.source().as_bytes());
    hasher.update(&[0]);
    hasher.update(config.raw().as_bytes());
    ConfigHash::from_bytes(*hasher.finalize().as_bytes())
}

/// The delusion detector
#[derive(Clone)]
pub struct DelusionDetector {
    source: Arc<dyn PatternSource>,
    cache: Cache<CacheKey, Arc<DelusionAnalysis>>,
    config: DetectorConfig,
    audit: Option<Arc<dyn AuditSink>>,
    computations: Arc<AtomicU64>,
}

impl std::fmt::Debug for DelusionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelusionDetector")
            .field("config", &self.config)
            .field("audit", &self.audit)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DelusionDetector {
    /// Detector over a pattern source with default limits
    #[must_use]
    pub fn new(source: Arc<dyn PatternSource>) -> Self {
        Self::with_config(source, DetectorConfig::default())
    }

    #[must_use]
    pub fn with_config(source: Arc<dyn PatternSource>, config: DetectorConfig) -> Self {
        Self {
            source,
            cache: Cache::new(config.cache_capacity),
            config,
            audit: None,
            computations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record every analysis to an audit sink
    #[must_use]
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            computations: self.computations.load(Ordering::Relaxed),
            cached_entries: self.cache.entry_count(),
        }
    }

    fn snapshot(&self) -> Result<Arc<PatternSnapshot>, DetectorError> {
        self.source
            .snapshot()
            .map_err(|e| DetectorError::PatternStoreUnavailable(e.to_string()))
    }

    fn check_size(&self, size: usize) -> Result<(), DetectorError> {
        if size > self.config.max_input_bytes {
            return Err(DetectorError::InputTooLarge {
                size,
                max: self.config.max_input_bytes,
            });
        }
        Ok(())
    }

    /// Analyse a parsed configuration
    ///
    /// Deterministic for a fixed store version and configuration hash.
    ///
    /// # Errors
    /// - [`DetectorError::InputTooLarge`] above the configured input size
    /// - [`DetectorError::PatternStoreUnavailable`] if patterns cannot be loaded
    /// - [`DetectorError::Parse`] if the configuration cannot be normalized
    /// - [`DetectorError::Timeout`] if detection exceeds the configured bound
    pub async fn analyze_configuration(
        &self,
        config: &Configuration,
    ) -> Result<DelusionAnalysis, DetectorError> {
        self.check_size(config.raw().len())?;
        let snapshot = self.snapshot()?;
        let key = (config.hash(), snapshot.version(), source_digest(config));

        let analysis = self
            .cache
            .try_get_with(key, self.compute(snapshot, config.clone()))
            .await
            .map_err(|e| (*e).clone())?;

        info!(
            config = %config.hash().short(),
            store_version = key.1,
            findings = analysis.patterns.len(),
            score = analysis.confidence_score,
            "configuration analysed"
        );
        self.record(&analysis)?;
        Ok((*analysis).clone())
    }

    async fn compute(
        &self,
        snapshot: Arc<PatternSnapshot>,
        config: Configuration,
    ) -> Result<Arc<DelusionAnalysis>, DetectorError> {
        let weights = self.config.severity_weights;
        let bound = self.config.timeout;
        let task = tokio::task::spawn_blocking(move || run_analysis(&snapshot, &config, &weights));
        let analysis = tokio::time::timeout(bound, task)
            .await
            .map_err(|_| DetectorError::Timeout(bound))?
            .map_err(|e| DetectorError::Task(e.to_string()))??;
        self.computations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(analysis))
    }

    fn record(&self, analysis: &DelusionAnalysis) -> Result<(), DetectorError> {
        let Some(sink) = &self.audit else {
            return Ok(());
        };
        let record = AuditRecord {
            config_hash: analysis.config_hash,
            recorded_at: Utc::now(),
            analysis: analysis.clone(),
        };
        sink.append(&record).map_err(DetectorError::Audit)
    }

    /// Textual pass only, for input that cannot be parsed
    ///
    /// # Errors
    /// [`DetectorError::InputTooLarge`] or [`DetectorError::PatternStoreUnavailable`].
    pub fn detect_patterns(&self, origin: &str, raw: &str) -> Result<Vec<DelusionPattern>, DetectorError> {
        self.check_size(raw.len())?;
        let snapshot = self.snapshot()?;
        Ok(crate::analysis::consolidate(textual_matches(&snapshot, origin, raw)))
    }

    /// Partial analysis of raw text, labeled [`Coverage::TextualOnly`]
    ///
    /// # Errors
    /// As [`detect_patterns`](Self::detect_patterns).
    pub fn analyze_text(&self, origin: &str, raw: &str) -> Result<DelusionAnalysis, DetectorError> {
        self.check_size(raw.len())?;
        let snapshot = self.snapshot()?;
        let matches = textual_matches(&snapshot, origin, raw);
        let analysis = DelusionAnalysis::assemble(
            ConfigHash::compute(raw.as_bytes()),
            snapshot.version(),
            Coverage::TextualOnly,
            matches,
            &self.config.severity_weights,
        );
        warn!(origin, findings = analysis.patterns.len(), "textual-only analysis");
        self.record(&analysis)?;
        Ok(analysis)
    }

    /// Record a reviewer correction
    ///
    /// In-flight analyses keep the snapshot they started with; the next
    /// analysis runs against the new store version.
    ///
    /// # Errors
    /// [`DetectorError::UnknownPattern`], [`DetectorError::Rejected`] for an
    /// invalid confidence, or an unavailable store.
    pub fn learn_from_correction(
        &self,
        pattern_id: &PatternId,
        correction: Correction,
    ) -> Result<CorrectionRecord, DetectorError> {
        let record = self.source.record_correction(pattern_id, correction)?;
        debug!(pattern = %pattern_id, version = record.store_version, "correction applied");
        Ok(record)
    }

    /// Replace the pattern database atomically
    ///
    /// # Errors
    /// [`DetectorError::Rejected`] if any pattern fails to compile.
    pub fn update_pattern_database(&self, patterns: Vec<DelusionPattern>) -> Result<u64, DetectorError> {
        Ok(self.source.update_pattern_database(patterns)?)
    }
}

/// Both passes over one configuration
///
/// # Errors
/// [`ParseError::Normalize`] when the configuration cannot be flattened.
pub fn run_analysis(
    snapshot: &PatternSnapshot,
    config: &Configuration,
    weights: &SeverityWeights,
) -> Result<DelusionAnalysis, ParseError> {
    let fields = normalize(config)?;
    debug!(
        config = %config.hash().short(),
        fields = fields.len(),
        sections = ?section_sizes(config),
        "normalized"
    );
    let mut matches = structural_matches(snapshot, config, &fields);
    matches.extend(textual_matches(snapshot, config.source(), config.raw()));
    Ok(DelusionAnalysis::assemble(
        config.hash(),
        snapshot.version(),
        Coverage::Full,
        matches,
        weights,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkrguard_config::{parse_str, ConfigFormat};
    use pkrguard_patterns::{PatternStore, StoreError};

    const CLEAN: &str = r#"{
  "variables": {"region": "us-east-1"},
  "builders": [{"type": "docker", "image": "ubuntu:22.04", "commit": true}],
  "provisioners": [{"type": "shell", "inline": ["apt-get update"]}]
}"#;

    fn detector() -> DelusionDetector {
        DelusionDetector::new(Arc::new(PatternStore::builtin().unwrap()))
    }

    #[derive(Debug)]
    struct Offline;

    impl PatternSource for Offline {
        fn snapshot(&self) -> Result<Arc<PatternSnapshot>, StoreError> {
            Err(StoreError::Unavailable {
                path: "patterns.json".into(),
                reason: "offline".into(),
            })
        }

        fn record_correction(&self, id: &PatternId, _: Correction) -> Result<CorrectionRecord, StoreError> {
            Err(StoreError::UnknownPattern(id.clone()))
        }

        fn update_pattern_database(&self, _: Vec<DelusionPattern>) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable {
                path: "patterns.json".into(),
                reason: "offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn clean_configuration_has_no_findings() {
        let config = parse_str("clean.json", CLEAN, ConfigFormat::Json).unwrap();
        let analysis = detector().analyze_configuration(&config).await.unwrap();
        assert!(analysis.is_clean(), "unexpected: {:?}", analysis.patterns);
        assert!(analysis.confidence_score.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn store_unavailable_is_reported() {
        let config = parse_str("clean.json", CLEAN, ConfigFormat::Json).unwrap();
        let err = DelusionDetector::new(Arc::new(Offline))
            .analyze_configuration(&config)
            .await
            .unwrap_err();
        assert!(matches!(err, DetectorError::PatternStoreUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn oversized_input_is_rejected() {
        let config = parse_str("clean.json", CLEAN, ConfigFormat::Json).unwrap();
        let detector = DelusionDetector::with_config(
            Arc::new(PatternStore::builtin().unwrap()),
            DetectorConfig {
                max_input_bytes: 16,
                ..DetectorConfig::default()
            },
        );
        assert!(matches!(
            detector.analyze_configuration(&config).await,
            Err(DetectorError::InputTooLarge { .. })
        ));
        assert!(detector.detect_patterns("x", CLEAN).is_err());
    }

    #[tokio::test]
    async fn unnormalizable_configuration_is_a_parse_error() {
        let config = parse_str("bad.json", r#"{"builders": [{"image": "x"}]}"#, ConfigFormat::Json).unwrap();
        let err = detector().analyze_configuration(&config).await.unwrap_err();
        assert!(matches!(err, DetectorError::Parse(_)));
        assert!(err.allows_textual_fallback());
    }

    #[tokio::test]
    async fn zero_timeout_times_out() {
        let lines: Vec<String> = (0..20_000).map(|i| format!("echo step {i}")).collect();
        let doc = serde_json::json!({
            "builders": [{"type": "docker", "image": "ubuntu"}],
            "provisioners": [{"type": "shell", "inline": lines}],
        });
        let config = parse_str("big.json", &doc.to_string(), ConfigFormat::Json).unwrap();
        let detector = DelusionDetector::with_config(
            Arc::new(PatternStore::builtin().unwrap()),
            DetectorConfig {
                timeout: Duration::ZERO,
                ..DetectorConfig::default()
            },
        );
        assert!(matches!(
            detector.analyze_configuration(&config).await,
            Err(DetectorError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn correction_changes_the_next_analysis_only() {
        let store = Arc::new(PatternStore::builtin().unwrap());
        let detector = DelusionDetector::new(Arc::clone(&store) as Arc<dyn PatternSource>);
        let json = r#"{"builders": [{"type": "docker", "image": "u", "ssh_username": "root"}], "provisioners": [{"type": "shell", "inline": ["true"]}]}"#;
        let config = parse_str("root.json", json, ConfigFormat::Json).unwrap();

        let first = detector.analyze_configuration(&config).await.unwrap();
        assert_eq!(first.patterns.len(), 1);
        let id = first.patterns[0].id.clone();

        detector
            .learn_from_correction(&id, Correction::set_confidence(0.2))
            .unwrap();
        let second = detector.analyze_configuration(&config).await.unwrap();

        assert!((first.patterns[0].confidence - 0.7).abs() < f64::EPSILON);
        assert!((second.patterns[0].confidence - 0.2).abs() < f64::EPSILON);
        assert!(second.store_version > first.store_version);
        assert!(second.confidence_score < first.confidence_score);
    }

    #[tokio::test]
    async fn detect_patterns_handles_broken_text() {
        let found = detector()
            .detect_patterns("broken.json", "{\"builders\": [{\"type\": \"docker\",}]}")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, pkrguard_patterns::PatternKind::Syntax);

        let partial = detector().analyze_text("broken.json", "{ \"password\": \"x\",}").unwrap();
        assert_eq!(partial.coverage, Coverage::TextualOnly);
    }

    #[tokio::test]
    async fn bad_pattern_update_is_rejected() {
        let detector = detector();
        let bad = DelusionPattern::new(
            pkrguard_patterns::PatternKind::Syntax,
            pkrguard_patterns::Severity::Low,
            "text:(",
            "d",
            "r",
            0.5,
        );
        assert!(matches!(
            detector.update_pattern_database(vec![bad]),
            Err(DetectorError::Rejected(_))
        ));
    }
}
