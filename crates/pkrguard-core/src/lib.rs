//! pkrguard core
//!
//! The toolkit facade the CLI and embedding applications use.
//!
//! # Core Concepts
//!
//! - [`ToolkitSettings`]: TOML settings, every field defaulted
//! - [`Toolkit`]: pattern store, detector, recovery engine, validation agent
//!   and learning loop wired from one set of settings
//! - [`ToolkitError`]: every component error, classified with
//!   `is_retryable` and `requires_human`
//! - [`logging::init`]: the process-wide tracing subscriber

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod logging;

mod error;
mod settings;
mod toolkit;

pub use error::ToolkitError;
pub use settings::{SettingsError, ToolkitSettings};
pub use toolkit::{AnalysisOutcome, Certification, DiagnosisOutcome, Toolkit, ValidationOutcome};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the toolkit
    pub use crate::{Toolkit, ToolkitError, ToolkitSettings};
    pub use pkrguard_config::{ConfigHash, Configuration};
    pub use pkrguard_detector::DelusionAnalysis;
    pub use pkrguard_recovery::{CancelSignal, RecoveryTarget};
    pub use pkrguard_validation::{BuildResult, Certificate};
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
