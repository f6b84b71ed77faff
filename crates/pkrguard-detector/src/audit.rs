//! Analysis audit trail

use crate::analysis::DelusionAnalysis;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pkrguard_config::ConfigHash;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One persisted analysis, keyed by configuration hash and time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub config_hash: ConfigHash,
    pub recorded_at: DateTime<Utc>,
    pub analysis: DelusionAnalysis,
}

/// Destination for audit records
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Append a record
    ///
    /// # Errors
    /// Returns a description of the write failure.
    fn append(&self, record: &AuditRecord) -> Result<(), String>;
}

/// JSON-lines file, one record per line
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditLog {
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

    /// Read every record back; unreadable lines are skipped
    ///
    /// # Errors
    /// I/O failure opening the file.
    pub fn read_all(&self) -> std::io::Result<Vec<AuditRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), String> {
        let mut line = serde_json::to_string(record).map_err(|e| e.to_string())?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("{}: {e}", self.path.display()))?;
        file.write_all(line.as_bytes()).map_err(|e| e.to_string())
    }
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), String> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Coverage;
    use pkrguard_patterns::SeverityWeights;

    fn record() -> AuditRecord {
        let hash = ConfigHash::compute(b"cfg");
        AuditRecord {
            config_hash: hash,
            recorded_at: Utc::now(),
            analysis: DelusionAnalysis::assemble(hash, 1, Coverage::Full, vec![], &SeverityWeights::default()),
        }
    }

    #[test]
    fn jsonl_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::new(dir.path().join("audit").join("analysis.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
        log.append(&record()).unwrap();
        log.append(&record()).unwrap();
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].config_hash, ConfigHash::compute(b"cfg"));
    }

    #[test]
    fn memory_sink_keeps_records() {
        let sink = MemoryAuditLog::new();
        sink.append(&record()).unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
