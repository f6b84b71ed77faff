//! Toolkit settings
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! is a valid configuration.

use pkrguard_detector::DetectorConfig;
use pkrguard_patterns::SeverityWeights;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Settings could not be loaded
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Everything the toolkit reads from its settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolkitSettings {
    /// Weights used by the delusion confidence score
    pub severity_weights: SeverityWeights,
    /// Overall and per-dimension score a certificate requires
    pub certification_threshold: f64,
    pub certificate_ttl_secs: u64,

    /// Root for persisted state; the paths below default to files in it
    pub state_dir: PathBuf,
    pub pattern_store: Option<PathBuf>,
    pub certificate_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub escalation_log: Option<PathBuf>,
    pub signing_key: Option<PathBuf>,

    pub detector_timeout_ms: u64,
    pub max_input_bytes: usize,
    pub analysis_cache_capacity: u64,

    /// Attempts when the pattern store file is unavailable
    pub store_open_attempts: u32,
    pub store_retry_base_ms: u64,
    /// First retry delay for transient recovery steps
    pub recovery_backoff_ms: u64,
    /// Bound on build evidence checks during validation
    pub validation_timeout_ms: u64,
}

impl Default for ToolkitSettings {
    fn default() -> Self {
        Self {
            severity_weights: SeverityWeights::default(),
            certification_threshold: 0.7,
            certificate_ttl_secs: 24 * 60 * 60,
            state_dir: PathBuf::from(".pkrguard"),
            pattern_store: None,
            certificate_dir: None,
            audit_log: None,
            escalation_log: None,
            signing_key: None,
            detector_timeout_ms: 5_000,
            max_input_bytes: 10 * 1024 * 1024,
            analysis_cache_capacity: 1_000,
            store_open_attempts: 3,
            store_retry_base_ms: 100,
            recovery_backoff_ms: 250,
            validation_timeout_ms: 30_000,
        }
    }
}

impl ToolkitSettings {
    /// Load and validate a settings file
    ///
    /// # Errors
    /// Unreadable file, malformed TOML, unknown keys, or out-of-range values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        info!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// The first field out of range.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let unit = |field: &'static str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(SettingsError::Invalid {
                    field,
                    reason: format!("{value} is outside [0, 1]"),
                })
            }
        };
        unit("certification_threshold", self.certification_threshold)?;
        unit("severity_weights.critical", self.severity_weights.critical)?;
        unit("severity_weights.high", self.severity_weights.high)?;
        unit("severity_weights.medium", self.severity_weights.medium)?;
        unit("severity_weights.low", self.severity_weights.low)?;

        if self.detector_timeout_ms == 0 {
            return Err(SettingsError::Invalid {
                field: "detector_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.store_open_attempts == 0 {
            return Err(SettingsError::Invalid {
                field: "store_open_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    fn in_state_dir(&self, explicit: Option<&PathBuf>, name: &str) -> PathBuf {
        explicit.cloned().unwrap_or_else(|| self.state_dir.join(name))
    }

    #[must_use]
    pub fn pattern_store_path(&self) -> PathBuf {
        self.in_state_dir(self.pattern_store.as_ref(), "patterns.json")
    }

    #[must_use]
    pub fn certificate_dir_path(&self) -> PathBuf {
        self.in_state_dir(self.certificate_dir.as_ref(), "certificates")
    }

    #[must_use]
    pub fn audit_log_path(&self) -> PathBuf {
        self.in_state_dir(self.audit_log.as_ref(), "analysis-audit.jsonl")
    }

    #[must_use]
    pub fn escalation_log_path(&self) -> PathBuf {
        self.in_state_dir(self.escalation_log.as_ref(), "escalations.jsonl")
    }

    #[must_use]
    pub fn signing_key_path(&self) -> PathBuf {
        self.in_state_dir(self.signing_key.as_ref(), "signing.key")
    }

    /// Detector limits derived from these settings
    #[must_use]
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            max_input_bytes: self.max_input_bytes,
            timeout: Duration::from_millis(self.detector_timeout_ms),
            cache_capacity: self.analysis_cache_capacity,
            severity_weights: self.severity_weights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_is_all_defaults() {
        let settings: ToolkitSettings = toml::from_str("").unwrap();
        assert_eq!(settings, ToolkitSettings::default());
        settings.validate().unwrap();
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let settings: ToolkitSettings = toml::from_str(
            r#"
            certification_threshold = 0.8
            state_dir = "/var/lib/pkrguard"

            [severity_weights]
            low = 0.2
            "#,
        )
        .unwrap();
        assert_eq!(settings.certification_threshold, 0.8);
        assert_eq!(settings.severity_weights.low, 0.2);
        assert_eq!(settings.severity_weights.critical, 1.0);
        assert_eq!(
            settings.pattern_store_path(),
            PathBuf::from("/var/lib/pkrguard/patterns.json")
        );
    }

    #[test]
    fn explicit_paths_win() {
        let settings = ToolkitSettings {
            signing_key: Some(PathBuf::from("/etc/pkrguard/key")),
            ..ToolkitSettings::default()
        };
        assert_eq!(settings.signing_key_path(), PathBuf::from("/etc/pkrguard/key"));
        assert_eq!(
            settings.certificate_dir_path(),
            PathBuf::from(".pkrguard/certificates")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ToolkitSettings>("certification_treshold = 0.5").is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkrguard.toml");
        std::fs::write(&path, "certification_threshold = 1.5\n").unwrap();
        assert!(matches!(
            ToolkitSettings::load(&path),
            Err(SettingsError::Invalid {
                field: "certification_threshold",
                ..
            })
        ));
    }
}
