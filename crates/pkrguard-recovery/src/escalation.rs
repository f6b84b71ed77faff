//! Escalation to humans
//!
//! Sinks are fire-and-forget: a failure to record an escalation is logged
//! and never fails the recovery call that raised it.

use crate::state_machine::RecoveryState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pkrguard_config::ConfigHash;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// A recovery attempt handed to a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: uuid::Uuid,
    pub config_hash: ConfigHash,
    pub raised_at: DateTime<Utc>,
    /// State the attempt was in when it escalated
    pub from_state: RecoveryState,
    pub plan_id: Option<String>,
    pub reason: String,
    pub evidence: Vec<String>,
}

impl Escalation {
    #[must_use]
    pub fn new(config_hash: ConfigHash, from_state: RecoveryState, reason: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            config_hash,
            raised_at: Utc::now(),
            from_state,
            plan_id: None,
            reason: reason.into(),
            evidence: Vec::new(),
        }
    }

    #[must_use]
    pub fn for_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Destination for escalations
pub trait EscalationSink: Send + Sync + std::fmt::Debug {
    fn escalate(&self, escalation: &Escalation);
}

/// Logs escalations as warnings
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEscalation;

impl EscalationSink for TracingEscalation {
    fn escalate(&self, e: &Escalation) {
        warn!(
            id = %e.id,
            config = %e.config_hash.short(),
            from = %e.from_state,
            plan = e.plan_id.as_deref().unwrap_or("-"),
            evidence = e.evidence.len(),
            "escalated: {}",
            e.reason
        );
    }
}

/// JSON-lines escalation log
#[derive(Debug)]
pub struct JsonlEscalationLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlEscalationLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every recorded escalation, skipping unreadable lines
    #[must_use]
    pub fn read_all(&self) -> Vec<Escalation> {
        std::fs::read_to_string(&self.path)
            .map(|text| {
                text.lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn append(&self, escalation: &Escalation) -> std::io::Result<()> {
        let mut line = serde_json::to_string(escalation)?;
        line.push('\n');
        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(line.as_bytes())
    }
}

impl EscalationSink for JsonlEscalationLog {
    fn escalate(&self, escalation: &Escalation) {
        TracingEscalation.escalate(escalation);
        if let Err(e) = self.append(escalation) {
            error!(path = %self.path.display(), error = %e, "failed to record escalation");
        }
    }
}

/// Keeps escalations in memory
#[derive(Debug, Default)]
pub struct MemoryEscalations {
    items: Mutex<Vec<Escalation>>,
}

impl MemoryEscalations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Escalation> {
        self.items.lock().clone()
    }
}

impl EscalationSink for MemoryEscalations {
    fn escalate(&self, escalation: &Escalation) {
        self.items.lock().push(escalation.clone());
    }
}
