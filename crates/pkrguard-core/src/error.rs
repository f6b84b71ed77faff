//! Toolkit error taxonomy
//!
//! One enum over every component error, classified by what the caller
//! should do next.

use crate::settings::SettingsError;
use pkrguard_config::{ConfigHash, ParseError};
use pkrguard_detector::DetectorError;
use pkrguard_patterns::{LearningError, StoreError};
use pkrguard_recovery::RecoveryError;
use pkrguard_validation::{Dimension, ValidationError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main toolkit error type
#[derive(Debug, thiserror::Error)]
pub enum ToolkitError {
    /// Configuration could not be parsed or normalized
    #[error("parse error: {0}")]
    Parse(Arc<ParseError>),

    /// Patterns could not be loaded
    #[error("pattern store unavailable: {0}")]
    PatternStoreUnavailable(String),

    /// Another recovery holds this configuration
    #[error("recovery already in progress for {}", .0.short())]
    RecoveryInProgress(ConfigHash),

    /// Rollback failed; a human has to inspect the artifacts
    #[error("unrecoverable state after plan {plan_id}: {reason}")]
    UnrecoverableState { plan_id: String, reason: String },

    /// Certificate refused
    #[error("insufficient confidence: {overall:.3} < {threshold} (failing: {failing_dimensions:?})")]
    InsufficientConfidence {
        overall: f64,
        threshold: f64,
        gap: f64,
        failing_dimensions: Vec<Dimension>,
        remediation_hints: Vec<String>,
    },

    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("analysis error: {0}")]
    Detector(DetectorError),

    #[error("recovery error: {0}")]
    Recovery(RecoveryError),

    #[error("validation error: {0}")]
    Validation(ValidationError),

    #[error("learning loop error: {0}")]
    Learning(#[from] LearningError),
}

impl ToolkitError {
    /// Whether retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PatternStoreUnavailable(_) | Self::RecoveryInProgress(_) | Self::Timeout(_) => true,
            Self::Detector(e) => e.is_retryable(),
            Self::Recovery(e) => e.is_retryable(),
            Self::Validation(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether a human has to step in
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        match self {
            Self::UnrecoverableState { .. } => true,
            Self::Recovery(e) => e.requires_human(),
            _ => false,
        }
    }

    /// Whether the textual pass can still run on the input
    #[must_use]
    pub fn allows_textual_fallback(&self) -> bool {
        match self {
            Self::Parse(e) => e.allows_textual_fallback(),
            Self::Detector(e) => e.allows_textual_fallback(),
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ParseError> for ToolkitError {
    fn from(e: ParseError) -> Self {
        Self::Parse(Arc::new(e))
    }
}

impl From<StoreError> for ToolkitError {
    fn from(e: StoreError) -> Self {
        Self::PatternStoreUnavailable(e.to_string())
    }
}

impl From<DetectorError> for ToolkitError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::Parse(p) => Self::Parse(p),
            DetectorError::PatternStoreUnavailable(reason) => Self::PatternStoreUnavailable(reason),
            DetectorError::Timeout(d) => Self::Timeout(d),
            other => Self::Detector(other),
        }
    }
}

impl From<RecoveryError> for ToolkitError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::RecoveryInProgress(hash) => Self::RecoveryInProgress(hash),
            RecoveryError::UnrecoverableState { plan_id, reason } => {
                Self::UnrecoverableState { plan_id, reason }
            }
            RecoveryError::Detector(d) => d.into(),
            RecoveryError::Parse(p) => p.into(),
            other => Self::Recovery(other),
        }
    }
}

impl From<ValidationError> for ToolkitError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::InsufficientConfidence {
                overall,
                threshold,
                gap,
                failing_dimensions,
                remediation_hints,
            } => Self::InsufficientConfidence {
                overall,
                threshold,
                gap,
                failing_dimensions,
                remediation_hints,
            },
            ValidationError::Detector(d) => d.into(),
            ValidationError::Timeout(d) => Self::Timeout(d),
            ValidationError::Io { path, source } => Self::Io { path, source },
            other => Self::Validation(other),
        }
    }
}
