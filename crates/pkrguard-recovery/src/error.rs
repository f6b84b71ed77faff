//! Error types for recovery

use crate::state_machine::RecoveryState;
use pkrguard_config::{ConfigHash, ParseError};
use pkrguard_detector::DetectorError;
use pkrguard_patterns::{LearningError, StoreError};
use std::path::PathBuf;

/// Recovery error type
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// A template step has no rollback counterpart
    #[error("template `{template}` step {step} declares no rollback")]
    MissingRollback { template: String, step: usize },

    /// No automatic plan applies; the attempt is escalated
    #[error("no recovery plan: {reason}")]
    NoPlan { reason: String },

    /// Another recovery holds the lease for this configuration
    #[error("recovery already in progress for {}", .0.short())]
    RecoveryInProgress(ConfigHash),

    /// Rollback failed; the artifacts may be half-modified
    #[error("unrecoverable state after plan {plan_id}: {reason}")]
    UnrecoverableState { plan_id: String, reason: String },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: RecoveryState,
        to: RecoveryState,
    },

    #[error("analysis failed: {0}")]
    Detector(#[from] DetectorError),

    #[error("configuration error: {0}")]
    Parse(#[from] ParseError),

    #[error("pattern store error: {0}")]
    Store(#[from] StoreError),

    #[error("learning loop error: {0}")]
    Learning(#[from] LearningError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecoveryError {
    /// Check if a human has to step in
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::UnrecoverableState { .. } | Self::NoPlan { .. } | Self::MissingRollback { .. }
        )
    }

    /// Check if the same call may succeed later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RecoveryInProgress(_) => true,
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

/// Failure of a single step attempt
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    /// Worth retrying with backoff
    pub transient: bool,
}

impl StepError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}
