//! Versioned pattern store
//!
//! Readers take an [`Arc<PatternSnapshot>`] and keep it for the whole
//! analysis; writers publish a new snapshot by copy-on-write through
//! [`ArcSwap::rcu`]. A reader never sees a half-applied update.
//!
//! Correction histories live in a [`DashMap`] keyed by pattern id, so
//! corrections to different patterns only contend on the final pointer swap.

use crate::builtin;
use crate::correction::{demoted, promoted, Correction, CorrectionRecord, Verdict};
use crate::pattern::{CompiledPattern, DelusionPattern, Pass, PatternError, PatternId};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive failures before a recovery template is flagged for review
pub const REVIEW_THRESHOLD: u32 = 3;

/// Errors from the pattern store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backing file cannot be read
    #[error("pattern store unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// Backing file exists but cannot be loaded
    #[error("pattern store at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("unknown pattern {0}")]
    UnknownPattern(PatternId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io(_))
    }
}

/// Immutable, versioned view of the pattern set
///
/// Patterns live in an arena in catalog order; `index` maps ids to arena slots.
#[derive(Debug)]
pub struct PatternSnapshot {
    version: u64,
    arena: Vec<CompiledPattern>,
    index: HashMap<PatternId, usize>,
}

impl PatternSnapshot {
    fn from_compiled(version: u64, arena: Vec<CompiledPattern>) -> Self {
        let index = arena
            .iter()
            .enumerate()
            .map(|(slot, c)| (c.pattern.id.clone(), slot))
            .collect();
        Self {
            version,
            arena,
            index,
        }
    }

    /// Build a snapshot, compiling every pattern
    ///
    /// # Errors
    /// The first pattern that fails validation or compilation, or a
    /// duplicate id.
    pub fn compile(version: u64, patterns: Vec<DelusionPattern>) -> Result<Self, PatternError> {
        let mut seen = HashSet::new();
        let mut arena = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if !seen.insert(pattern.id.clone()) {
                return Err(PatternError::Duplicate(pattern.id));
            }
            arena.push(CompiledPattern::compile(pattern)?);
        }
        Ok(Self::from_compiled(version, arena))
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &PatternId) -> Option<&CompiledPattern> {
        self.index.get(id).map(|&slot| &self.arena[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledPattern> {
        self.arena.iter()
    }

    /// Patterns of one detection pass
    pub fn for_pass(&self, pass: Pass) -> impl Iterator<Item = &CompiledPattern> {
        self.arena.iter().filter(move |c| c.matcher.pass() == pass)
    }

    /// Plain pattern records, in catalog order
    #[must_use]
    pub fn patterns(&self) -> Vec<DelusionPattern> {
        self.arena.iter().map(|c| c.pattern.clone()).collect()
    }

    /// Next version with one pattern's confidence changed
    fn with_confidence(&self, id: &PatternId, confidence: f64) -> Option<Self> {
        let slot = *self.index.get(id)?;
        let mut arena = self.arena.clone();
        let pattern = &mut arena[slot].pattern;
        pattern.confidence = confidence;
        pattern.version += 1;
        Some(Self {
            version: self.version + 1,
            arena,
            index: self.index.clone(),
        })
    }
}

/// One entry of the append-only change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store version after the change
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    /// Bulk replacement of the pattern set
    Replace { pattern_count: usize },
    /// Learned confidence change
    Confidence {
        pattern_id: PatternId,
        before: f64,
        after: f64,
        reason: String,
    },
    /// Recovery template outcome
    Template {
        template: String,
        success: bool,
        flagged: bool,
    },
}

/// Success/failure ledger of one recovery template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub flagged_for_review: bool,
}

/// Read seam used by the detector
pub trait PatternSource: Send + Sync {
    /// Current snapshot
    ///
    /// # Errors
    /// [`StoreError::Unavailable`] when patterns cannot be loaded.
    fn snapshot(&self) -> Result<Arc<PatternSnapshot>, StoreError>;

    /// Append a correction and publish the new weight
    ///
    /// # Errors
    /// Unknown pattern, invalid confidence, or an unavailable store.
    fn record_correction(
        &self,
        id: &PatternId,
        correction: Correction,
    ) -> Result<CorrectionRecord, StoreError>;

    /// Replace the whole pattern set atomically
    ///
    /// # Errors
    /// Any pattern that fails to compile; the store is left untouched.
    fn update_pattern_database(&self, patterns: Vec<DelusionPattern>) -> Result<u64, StoreError>;
}

#[derive(Serialize, Deserialize)]
struct StoreDocument {
    version: u64,
    patterns: Vec<DelusionPattern>,
    #[serde(default)]
    log: Vec<LogEntry>,
    #[serde(default)]
    templates: BTreeMap<String, TemplateStats>,
    #[serde(default)]
    corrections: BTreeMap<PatternId, Vec<CorrectionRecord>>,
}

/// The pattern store
#[derive(Debug)]
pub struct PatternStore {
    current: ArcSwap<PatternSnapshot>,
    histories: DashMap<PatternId, Vec<CorrectionRecord>>,
    log: Mutex<Vec<LogEntry>>,
    templates: DashMap<String, TemplateStats>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl PatternStore {
    /// In-memory store over the given patterns, at version 1
    ///
    /// # Errors
    /// Any pattern that fails to compile.
    pub fn new(patterns: Vec<DelusionPattern>) -> Result<Self, StoreError> {
        let snapshot = PatternSnapshot::compile(1, patterns)?;
        Ok(Self::from_parts(snapshot, None))
    }

    /// In-memory store seeded with the built-in catalog
    ///
    /// # Errors
    /// Only if the catalog itself fails to compile.
    pub fn builtin() -> Result<Self, StoreError> {
        Self::new(builtin::catalog())
    }

    fn from_parts(snapshot: PatternSnapshot, path: Option<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
            histories: DashMap::new(),
            log: Mutex::new(Vec::new()),
            templates: DashMap::new(),
            path,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a file-backed store, seeding the catalog when the file is absent
    ///
    /// # Errors
    /// [`StoreError::Unavailable`] when the file cannot be read,
    /// [`StoreError::Corrupt`] when it cannot be decoded or compiled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "seeding pattern store with built-in catalog");
                let snapshot = PatternSnapshot::compile(1, builtin::catalog())?;
                let store = Self::from_parts(snapshot, Some(path));
                store.flush()?;
                return Ok(store);
            }
            Err(e) => {
                return Err(StoreError::Unavailable {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.clone(),
            reason,
        };
        let doc: StoreDocument =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let snapshot =
            PatternSnapshot::compile(doc.version, doc.patterns).map_err(|e| corrupt(e.to_string()))?;

        info!(
            path = %path.display(),
            version = snapshot.version(),
            patterns = snapshot.len(),
            "opened pattern store"
        );

        let store = Self::from_parts(snapshot, Some(path));
        *store.log.lock() = doc.log;
        for (name, stats) in doc.templates {
            store.templates.insert(name, stats);
        }
        for (id, history) in doc.corrections {
            store.histories.insert(id, history);
        }
        Ok(store)
    }

    /// [`open`](Self::open), retrying retryable failures with exponential backoff
    ///
    /// # Errors
    /// The last error once `attempts` are exhausted, or the first
    /// non-retryable one.
    pub async fn open_with_retry(
        path: impl Into<PathBuf>,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let mut delay = base_delay;
        let mut attempt = 1;
        loop {
            let target = path.clone();
            let result = tokio::task::spawn_blocking(move || Self::open(target))
                .await
                .map_err(|e| StoreError::Unavailable {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            match result {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %e, "pattern store unavailable, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Backing file, if any
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Arc<PatternSnapshot> {
        self.current.load_full()
    }

    /// Current store version
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Replace every pattern at once
    ///
    /// All expressions are compiled before anything is published.
    ///
    /// # Errors
    /// The first pattern that fails; the store is untouched.
    pub fn update_pattern_database(&self, patterns: Vec<DelusionPattern>) -> Result<u64, StoreError> {
        let staged = PatternSnapshot::compile(0, patterns)?;
        let count = staged.len();
        let prev = self.current.rcu(|prev| {
            Arc::new(PatternSnapshot::from_compiled(
                prev.version() + 1,
                staged.arena.clone(),
            ))
        });
        let version = prev.version() + 1;
        self.append_log(version, Change::Replace {
            pattern_count: count,
        });
        info!(version, patterns = count, "pattern database replaced");
        Ok(version)
    }

    /// Append a correction to a pattern's history and publish its new weight
    ///
    /// Concurrent corrections to the same pattern are serialized on that
    /// pattern's history entry; the last one applied wins and every one is
    /// kept in the history.
    ///
    /// # Errors
    /// [`StoreError::UnknownPattern`], or [`PatternError::ConfidenceOutOfRange`]
    /// for an explicit override outside [0, 1].
    pub fn record_correction(
        &self,
        id: &PatternId,
        correction: Correction,
    ) -> Result<CorrectionRecord, StoreError> {
        if let Verdict::SetConfidence { confidence } = correction.verdict {
            if !(0.0..=1.0).contains(&confidence) || confidence.is_nan() {
                return Err(PatternError::ConfidenceOutOfRange {
                    id: id.clone(),
                    value: confidence,
                }
                .into());
            }
        }
        if self.current.load().get(id).is_none() {
            return Err(StoreError::UnknownPattern(id.clone()));
        }

        let mut history = self.histories.entry(id.clone()).or_default();
        let (version, before, after) =
            self.adjust(id, "correction", |c| correction.apply(c))?;
        let record = CorrectionRecord {
            sequence: history.len() as u64 + 1,
            store_version: version,
            recorded_at: Utc::now(),
            correction,
            confidence_before: before,
            confidence_after: after,
        };
        history.push(record.clone());
        drop(history);

        debug!(pattern = %id, before, after, version, "correction recorded");
        Ok(record)
    }

    /// Raise a pattern's confidence by one learning step
    ///
    /// # Errors
    /// [`StoreError::UnknownPattern`]
    pub fn promote(&self, id: &PatternId) -> Result<f64, StoreError> {
        self.adjust(id, "promote", promoted).map(|(_, _, after)| after)
    }

    /// Lower a pattern's confidence by one learning step
    ///
    /// # Errors
    /// [`StoreError::UnknownPattern`]
    pub fn demote(&self, id: &PatternId) -> Result<f64, StoreError> {
        self.adjust(id, "demote", demoted).map(|(_, _, after)| after)
    }

    fn adjust(
        &self,
        id: &PatternId,
        reason: &str,
        f: impl Fn(f64) -> f64,
    ) -> Result<(u64, f64, f64), StoreError> {
        let prev = self.current.rcu(|snap| {
            snap.get(id)
                .and_then(|c| snap.with_confidence(id, f(c.pattern.confidence)))
                .map_or_else(|| Arc::clone(snap), Arc::new)
        });
        let before = prev
            .get(id)
            .ok_or_else(|| StoreError::UnknownPattern(id.clone()))?
            .pattern
            .confidence;
        let after = f(before);
        let version = prev.version() + 1;
        self.append_log(version, Change::Confidence {
            pattern_id: id.clone(),
            before,
            after,
            reason: reason.to_string(),
        });
        Ok((version, before, after))
    }

    /// Correction history of one pattern, oldest first
    #[must_use]
    pub fn history(&self, id: &PatternId) -> Vec<CorrectionRecord> {
        self.histories
            .get(id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Record a recovery template outcome
    ///
    /// [`REVIEW_THRESHOLD`] consecutive failures flag the template; the flag
    /// stays until [`clear_template_flag`](Self::clear_template_flag).
    pub fn record_template_outcome(&self, template: &str, success: bool) -> TemplateStats {
        let mut entry = self.templates.entry(template.to_string()).or_default();
        if success {
            entry.successes += 1;
            entry.consecutive_failures = 0;
        } else {
            entry.failures += 1;
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= REVIEW_THRESHOLD && !entry.flagged_for_review {
                entry.flagged_for_review = true;
                warn!(template, failures = entry.consecutive_failures, "recovery template flagged for human review");
            }
        }
        let stats = entry.clone();
        drop(entry);

        self.append_log(self.version(), Change::Template {
            template: template.to_string(),
            success,
            flagged: stats.flagged_for_review,
        });
        stats
    }

    #[must_use]
    pub fn template_stats(&self, template: &str) -> Option<TemplateStats> {
        self.templates.get(template).map(|s| s.value().clone())
    }

    #[must_use]
    pub fn is_template_flagged(&self, template: &str) -> bool {
        self.templates
            .get(template)
            .is_some_and(|s| s.flagged_for_review)
    }

    /// Clear a review flag after a human looked at the template
    pub fn clear_template_flag(&self, template: &str) -> bool {
        match self.templates.get_mut(template) {
            Some(mut stats) if stats.flagged_for_review => {
                stats.flagged_for_review = false;
                stats.consecutive_failures = 0;
                true
            }
            _ => false,
        }
    }

    /// Change log, ordered by version
    #[must_use]
    pub fn log(&self) -> Vec<LogEntry> {
        self.log.lock().clone()
    }

    fn append_log(&self, version: u64, change: Change) {
        let entry = LogEntry {
            version,
            recorded_at: Utc::now(),
            change,
        };
        let mut log = self.log.lock();
        let at = log.partition_point(|e| e.version <= version);
        log.insert(at, entry);
    }

    /// Drop log entries already folded into the current snapshot
    ///
    /// Returns how many entries were removed.
    pub fn compact(&self) -> usize {
        let folded = self.version();
        let mut log = self.log.lock();
        let before = log.len();
        log.retain(|e| e.version > folded);
        let removed = before - log.len();
        debug!(removed, version = folded, "pattern log compacted");
        removed
    }

    /// Write the store to its backing file (temp file + rename)
    ///
    /// No-op for in-memory stores.
    ///
    /// # Errors
    /// I/O or serialization failures.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock();

        let snapshot = self.snapshot();
        let doc = StoreDocument {
            version: snapshot.version(),
            patterns: snapshot.patterns(),
            log: self.log(),
            templates: self
                .templates
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            corrections: self
                .histories
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

        debug!(path = %path.display(), version = doc.version, "pattern store flushed");
        Ok(())
    }
}

impl PatternSource for PatternStore {
    fn snapshot(&self) -> Result<Arc<PatternSnapshot>, StoreError> {
        Ok(PatternStore::snapshot(self))
    }

    fn record_correction(
        &self,
        id: &PatternId,
        correction: Correction,
    ) -> Result<CorrectionRecord, StoreError> {
        PatternStore::record_correction(self, id, correction)
    }

    fn update_pattern_database(&self, patterns: Vec<DelusionPattern>) -> Result<u64, StoreError> {
        PatternStore::update_pattern_database(self, patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{PatternKind, Severity};

    fn pattern(expr: &str, confidence: f64) -> DelusionPattern {
        DelusionPattern::new(PatternKind::Security, Severity::High, expr, "d", "r", confidence)
    }

    #[test]
    fn snapshot_indexes_patterns() {
        let store = PatternStore::new(vec![pattern("text:a", 0.5), pattern("empty:builders", 0.5)]).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.version(), 1);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.for_pass(Pass::Textual).count(), 1);
        let id = PatternId::derive(PatternKind::Security, "text:a");
        assert!(snap.get(&id).is_some());
    }

    #[test]
    fn bulk_update_is_all_or_nothing() {
        let store = PatternStore::new(vec![pattern("text:a", 0.5)]).unwrap();
        let err = store
            .update_pattern_database(vec![pattern("text:b", 0.5), pattern("text:(", 0.5)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Pattern(_)));
        assert_eq!(store.version(), 1);
        assert_eq!(store.snapshot().patterns()[0].pattern, "text:a");

        let version = store
            .update_pattern_database(vec![pattern("text:b", 0.5), pattern("text:c", 0.5)])
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = PatternStore::new(vec![pattern("text:a", 0.5), pattern("text:a", 0.6)]).unwrap_err();
        assert!(matches!(err, StoreError::Pattern(PatternError::Duplicate(_))));
    }

    #[test]
    fn correction_publishes_new_version() {
        let store = PatternStore::new(vec![pattern("text:a", 0.5)]).unwrap();
        let id = PatternId::derive(PatternKind::Security, "text:a");
        let old = store.snapshot();

        let record = store.record_correction(&id, Correction::false_positive()).unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.store_version, 2);
        assert!((record.confidence_after - 0.45).abs() < 1e-9);

        // the old snapshot is unchanged
        assert!((old.get(&id).unwrap().pattern.confidence - 0.5).abs() < f64::EPSILON);
        let new = store.snapshot();
        assert_eq!(new.version(), 2);
        assert_eq!(new.get(&id).unwrap().pattern.version, 2);
    }

    #[test]
    fn last_write_wins_with_history() {
        let store = PatternStore::new(vec![pattern("text:a", 0.5)]).unwrap();
        let id = PatternId::derive(PatternKind::Security, "text:a");
        store.record_correction(&id, Correction::set_confidence(0.9)).unwrap();
        store.record_correction(&id, Correction::set_confidence(0.3)).unwrap();

        let history = store.history(&id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sequence, 2);
        assert!((history[1].confidence_before - 0.9).abs() < f64::EPSILON);
        assert!((store.snapshot().get(&id).unwrap().pattern.confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_pattern_and_bad_override() {
        let store = PatternStore::new(vec![pattern("text:a", 0.5)]).unwrap();
        let ghost = PatternId::derive(PatternKind::Build, "text:zzz");
        assert!(matches!(
            store.record_correction(&ghost, Correction::confirmed()),
            Err(StoreError::UnknownPattern(_))
        ));
        let id = PatternId::derive(PatternKind::Security, "text:a");
        assert!(store.record_correction(&id, Correction::set_confidence(1.2)).is_err());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn template_flagged_after_three_failures() {
        let store = PatternStore::new(vec![]).unwrap();
        store.record_template_outcome("connectivity-retry", false);
        store.record_template_outcome("connectivity-retry", false);
        assert!(!store.is_template_flagged("connectivity-retry"));
        let stats = store.record_template_outcome("connectivity-retry", false);
        assert!(stats.flagged_for_review);
        assert_eq!(stats.failures, 3);

        // success resets the streak but not the flag
        let stats = store.record_template_outcome("connectivity-retry", true);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(store.is_template_flagged("connectivity-retry"));
        assert!(store.clear_template_flag("connectivity-retry"));
        assert!(!store.is_template_flagged("connectivity-retry"));
    }

    #[test]
    fn compact_drops_folded_entries() {
        let store = PatternStore::new(vec![pattern("text:a", 0.5)]).unwrap();
        let id = PatternId::derive(PatternKind::Security, "text:a");
        store.promote(&id).unwrap();
        store.demote(&id).unwrap();
        assert_eq!(store.log().len(), 2);
        assert!(store.log().windows(2).all(|w| w[0].version <= w[1].version));
        assert_eq!(store.compact(), 2);
        assert!(store.log().is_empty());
    }

    #[test]
    fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("patterns.json");

        let store = PatternStore::open(&path).unwrap();
        assert!(path.exists());
        let id = store.snapshot().patterns()[0].id.clone();
        store.record_correction(&id, Correction::confirmed().by("tester")).unwrap();
        store.record_template_outcome("syntax-fix", false);
        store.flush().unwrap();

        let reopened = PatternStore::open(&path).unwrap();
        assert_eq!(reopened.version(), store.version());
        assert_eq!(reopened.history(&id).len(), 1);
        assert_eq!(reopened.template_stats("syntax-fix").unwrap().failures, 1);
        assert_eq!(reopened.log().len(), store.log().len());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(PatternStore::open(&path), Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn open_with_retry_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // a path below a regular file can never be read
        let err = PatternStore::open_with_retry(blocker.join("patterns.json"), 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }
}
