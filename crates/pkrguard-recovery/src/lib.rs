//! pkrguard recovery engine
//!
//! Turns a failed build into a diagnosis, a reversible plan, and a committed
//! or rolled-back attempt.
//!
//! # Core Concepts
//!
//! - [`Diagnosis`]: failure type and ranked evidence from a build log
//! - [`RecoveryPlan`]: template steps, each with a declared rollback
//! - [`RecoveryEngine`]: leased, cancellable execution with snapshots
//! - [`EscalationSink`]: where attempts that need a human end up

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod cancel;
mod diagnosis;
mod engine;
mod error;
mod escalation;
mod executor;
mod plan;
mod result;
mod state_machine;

pub use cancel::CancelSignal;
pub use diagnosis::{diagnose, Diagnosis, Evidence, FailureType};
pub use engine::RecoveryEngine;
pub use error::{RecoveryError, StepError};
pub use escalation::{
    Escalation, EscalationSink, JsonlEscalationLog, MemoryEscalations, TracingEscalation,
};
pub use executor::{Backup, FileStepExecutor, RecoveryTarget, StepExecutor};
pub use plan::{
    build_plan, RecoveryAction, RecoveryPlan, RecoveryStep, RecoveryTemplate, RollbackAction,
    RollbackPlan, RollbackStep, StepTemplate, TemplateRegistry, IRREVERSIBLE_CONFIDENCE,
    MIN_PLAN_CONFIDENCE,
};
pub use result::{
    compare_analyses, AppliedFix, LearningData, Outcome, RecoveryResult, RecoveryValidation,
};
pub use state_machine::{allowed_transitions, validate_transition, Attempt, RecoveryState, Transition};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
