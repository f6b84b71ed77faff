//! Build metrics and artifact verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Functionality lost per artifact whose checksum does not match
pub const CHECKSUM_PENALTY: f64 = 0.25;

/// An artifact a build claims to have produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    /// Lowercase hex SHA-256
    pub expected_sha256: String,
}

/// Outcome of a finished build, as reported by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub peak_memory_mib: f64,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

/// Target and ceiling for each metric
///
/// At or below the target scores 1, at or above the ceiling scores 0,
/// linear in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub duration_target_secs: f64,
    pub duration_max_secs: f64,
    pub memory_target_mib: f64,
    pub memory_max_mib: f64,
    pub cpu_target_percent: f64,
    pub cpu_max_percent: f64,
}

impl Default for MetricBaseline {
    fn default() -> Self {
        Self {
            duration_target_secs: 900.0,
            duration_max_secs: 3600.0,
            memory_target_mib: 2048.0,
            memory_max_mib: 8192.0,
            cpu_target_percent: 80.0,
            cpu_max_percent: 100.0,
        }
    }
}

fn linear(value: f64, target: f64, max: f64) -> f64 {
    if value <= target {
        1.0
    } else if value >= max || max <= target {
        0.0
    } else {
        (max - value) / (max - target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricScores {
    pub duration: f64,
    pub memory: f64,
    pub cpu: f64,
    /// Mean of the three
    pub overall: f64,
}

#[must_use]
pub fn score_metrics(build: &BuildResult, baseline: &MetricBaseline) -> MetricScores {
    let duration = linear(
        build.duration_secs,
        baseline.duration_target_secs,
        baseline.duration_max_secs,
    );
    let memory = linear(
        build.peak_memory_mib,
        baseline.memory_target_mib,
        baseline.memory_max_mib,
    );
    let cpu = linear(
        build.cpu_percent,
        baseline.cpu_target_percent,
        baseline.cpu_max_percent,
    );
    MetricScores {
        duration,
        memory,
        cpu,
        overall: (duration + memory + cpu) / 3.0,
    }
}

/// Result of checking one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCheck {
    pub path: PathBuf,
    pub expected: String,
    /// `None` when the file could not be read
    pub actual: Option<String>,
    pub matches: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Check every artifact; relative paths resolve against `base`
#[must_use]
pub fn verify_artifacts(artifacts: &[ArtifactRecord], base: Option<&Path>) -> Vec<ArtifactCheck> {
    artifacts
        .iter()
        .map(|artifact| {
            let path = match base {
                Some(dir) if artifact.path.is_relative() => dir.join(&artifact.path),
                _ => artifact.path.clone(),
            };
            let expected = artifact.expected_sha256.trim().to_ascii_lowercase();
            match sha256_file(&path) {
                Ok(actual) => ArtifactCheck {
                    matches: actual == expected,
                    path: artifact.path.clone(),
                    expected,
                    actual: Some(actual),
                    error: None,
                },
                Err(e) => ArtifactCheck {
                    path: artifact.path.clone(),
                    expected,
                    actual: None,
                    matches: false,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect()
}
