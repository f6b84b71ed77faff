//! Certificate directory: one JSON file per configuration hash

use crate::certificate::Certificate;
use crate::error::ValidationError;
use pkrguard_config::ConfigHash;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Open a store, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ValidationError::io(&dir, e))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, config_hash: &ConfigHash) -> PathBuf {
        self.dir.join(format!("{config_hash}.json"))
    }

    /// Write a certificate, replacing any earlier one for the same hash
    pub fn save(&self, certificate: &Certificate) -> Result<PathBuf, ValidationError> {
        let path = self.path_for(&certificate.config_hash);
        let json = serde_json::to_vec_pretty(certificate)?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| ValidationError::io(&self.dir, e))?;
        tmp.write_all(&json).map_err(|e| ValidationError::io(&path, e))?;
        tmp.persist(&path).map_err(|e| ValidationError::io(&path, e.error))?;
        debug!(path = %path.display(), id = %certificate.id, "stored certificate");
        Ok(path)
    }

    /// Certificate for a hash, if one was stored
    pub fn load(&self, config_hash: &ConfigHash) -> Result<Option<Certificate>, ValidationError> {
        let path = self.path_for(config_hash);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ValidationError::io(path, e)),
        }
    }

    /// Hashes with a stored certificate, sorted
    pub fn list(&self) -> Result<Vec<ConfigHash>, ValidationError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ValidationError::io(&self.dir, e))?;
        let mut hashes: Vec<ConfigHash> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let stem = name.to_str()?.strip_suffix(".json")?;
                stem.parse().ok()
            })
            .collect();
        hashes.sort();
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateIssuer;
    use crate::report::ValidationReport;
    use crate::scoring::DimensionScores;
    use pkrguard_detector::{Coverage, DelusionAnalysis};
    use pkrguard_patterns::SeverityWeights;

    fn certificate(issuer: &CertificateIssuer, seed: &[u8]) -> Certificate {
        let analysis = DelusionAnalysis::assemble(
            ConfigHash::compute(seed),
            1,
            Coverage::Full,
            vec![],
            &SeverityWeights::default(),
        );
        issuer.issue(&ValidationReport::new(&analysis, DimensionScores::perfect(), vec![]), vec![])
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(dir.path().join("certs")).unwrap();
        let issuer = CertificateIssuer::ephemeral();
        let cert = certificate(&issuer, b"a");

        let path = store.save(&cert).unwrap();
        assert!(path.ends_with(format!("{}.json", cert.config_hash)));
        let back = store.load(&cert.config_hash).unwrap().unwrap();
        assert_eq!(back, cert);
        assert!(back.verify(&issuer.verifying_key()));
    }

    #[test]
    fn missing_is_none_and_list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(dir.path()).unwrap();
        assert!(store.load(&ConfigHash::compute(b"x")).unwrap().is_none());

        let issuer = CertificateIssuer::ephemeral();
        for seed in [b"b", b"a", b"c"] {
            store.save(&certificate(&issuer, seed)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));
    }
}
