//! Validation error types

use crate::scoring::Dimension;
use pkrguard_detector::DetectorError;
use std::path::PathBuf;
use std::time::Duration;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The configuration does not meet the certification threshold
    #[error("confidence {overall:.3} below threshold {threshold} (gap {gap:.3})")]
    InsufficientConfidence {
        overall: f64,
        threshold: f64,
        gap: f64,
        failing_dimensions: Vec<Dimension>,
        remediation_hints: Vec<String>,
    },

    #[error("analysis failed: {0}")]
    Detector(#[from] DetectorError),

    #[error("validation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Signing key file unusable
    #[error("signing key {path}: {reason}")]
    Key { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blocking check panicked or was cancelled
    #[error("validation task failed: {0}")]
    Task(String),
}

impl ValidationError {
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Detector(e) => e.is_retryable(),
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
