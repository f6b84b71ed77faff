//! Detector error types

use pkrguard_config::ParseError;
use pkrguard_patterns::{PatternId, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Errors from configuration analysis
///
/// Cloneable so one failed computation can be handed to every caller that
/// coalesced onto it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectorError {
    /// Configuration could not be normalized; the textual pass still applies
    #[error("parse error: {0}")]
    Parse(Arc<ParseError>),

    /// Patterns could not be loaded
    #[error("pattern store unavailable: {0}")]
    PatternStoreUnavailable(String),

    /// Detection exceeded its time bound
    #[error("detection timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Input above the configured size bound
    #[error("input too large: {size} bytes (max: {max})")]
    InputTooLarge { size: usize, max: usize },

    #[error("unknown pattern {0}")]
    UnknownPattern(PatternId),

    /// Correction or pattern update rejected by validation
    #[error("rejected: {0}")]
    Rejected(String),

    /// Audit record could not be written
    #[error("audit log write failed: {0}")]
    Audit(String),

    /// Blocking detection task panicked or was cancelled
    #[error("detection task failed: {0}")]
    Task(String),
}

impl DetectorError {
    /// Whether the caller can still run the textual fallback
    #[inline]
    #[must_use]
    pub fn allows_textual_fallback(&self) -> bool {
        matches!(self, Self::Parse(e) if e.allows_textual_fallback())
    }

    /// Whether retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PatternStoreUnavailable(_) | Self::Timeout(_))
    }
}

impl From<ParseError> for DetectorError {
    fn from(e: ParseError) -> Self {
        Self::Parse(Arc::new(e))
    }
}

impl From<StoreError> for DetectorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownPattern(id) => Self::UnknownPattern(id),
            StoreError::Pattern(p) => Self::Rejected(p.to_string()),
            other => Self::PatternStoreUnavailable(other.to_string()),
        }
    }
}
