//! Recovery attempt lifecycle

use crate::error::RecoveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Diagnosed,
    Planned,
    Executing,
    Validating,
    Committed,
    RolledBack,
    Escalated,
}

impl RecoveryState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Escalated)
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Diagnosed => "DIAGNOSED",
            Self::Planned => "PLANNED",
            Self::Executing => "EXECUTING",
            Self::Validating => "VALIDATING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Escalated => "ESCALATED",
        };
        f.write_str(s)
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: RecoveryState) -> &'static [RecoveryState] {
    use RecoveryState::{Committed, Diagnosed, Escalated, Executing, Planned, RolledBack, Validating};
    match from {
        Diagnosed => &[Planned, Escalated],
        Planned => &[Executing, Escalated],
        Executing => &[Validating, RolledBack, Escalated],
        Validating => &[Committed, RolledBack, Escalated],
        RolledBack => &[Escalated],
        Committed | Escalated => &[],
    }
}

/// Check a single transition
///
/// # Errors
/// [`RecoveryError::IllegalTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(from: RecoveryState, to: RecoveryState) -> Result<(), RecoveryError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(RecoveryError::IllegalTransition { from, to })
    }
}

/// One entry of an attempt's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: RecoveryState,
    pub at: DateTime<Utc>,
}

/// Tracks one attempt through the state machine
#[derive(Debug, Clone)]
pub struct Attempt {
    state: RecoveryState,
    history: Vec<Transition>,
}

impl Attempt {
    /// A freshly diagnosed attempt
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RecoveryState::Diagnosed,
            history: vec![Transition {
                state: RecoveryState::Diagnosed,
                at: Utc::now(),
            }],
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    #[must_use]
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `to`
    ///
    /// # Errors
    /// [`RecoveryError::IllegalTransition`]; the attempt is unchanged.
    pub fn advance(&mut self, to: RecoveryState) -> Result<(), RecoveryError> {
        validate_transition(self.state, to)?;
        self.state = to;
        self.history.push(Transition { state: to, at: Utc::now() });
        Ok(())
    }

    /// States visited, in order
    #[must_use]
    pub fn path(&self) -> Vec<RecoveryState> {
        self.history.iter().map(|t| t.state).collect()
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::new()
    }
}
