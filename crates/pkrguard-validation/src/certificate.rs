//! Signed validation certificates
//!
//! A certificate binds a configuration hash to its dimension scores for a
//! limited time. The Ed25519 signature covers a canonical byte message built
//! from every other field, so any edit to a stored certificate breaks it.

use crate::error::ValidationError;
use crate::report::ValidationReport;
use crate::scoring::DimensionScores;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pkrguard_config::ConfigHash;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Default certificate lifetime
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest lifetime a certificate can be given
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub config_hash: ConfigHash,
    pub issued_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub dimensions: DimensionScores,
    pub confidence_score: f64,
    pub audit_trail: Vec<String>,
    /// Hex-encoded verifying key
    pub issuer: String,
    /// Hex-encoded Ed25519 signature
    pub signature: String,
}

/// Scores enter the message in millionths so a JSON round trip cannot
/// perturb them
#[allow(clippy::cast_possible_truncation)]
fn micros(value: f64) -> i64 {
    (value * 1_000_000.0).round() as i64
}

fn certificate_message(
    id: Uuid,
    config_hash: ConfigHash,
    issued_at: DateTime<Utc>,
    expiry: DateTime<Utc>,
    dimensions: &DimensionScores,
    confidence_score: f64,
    audit_trail: &[String],
    issuer: &str,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(16 + 32 + 8 * 7 + 64 + audit_trail.len() * 32);
    msg.extend_from_slice(id.as_bytes());
    msg.extend_from_slice(config_hash.as_bytes());
    msg.extend_from_slice(&issued_at.timestamp_micros().to_le_bytes());
    msg.extend_from_slice(&expiry.timestamp_micros().to_le_bytes());
    for (_, score) in dimensions.iter() {
        msg.extend_from_slice(&micros(score).to_le_bytes());
    }
    msg.extend_from_slice(&micros(confidence_score).to_le_bytes());
    msg.extend_from_slice(&(audit_trail.len() as u64).to_le_bytes());
    for entry in audit_trail {
        msg.extend_from_slice(&(entry.len() as u64).to_le_bytes());
        msg.extend_from_slice(entry.as_bytes());
    }
    msg.extend_from_slice(issuer.as_bytes());
    msg
}

impl Certificate {
    fn message(&self) -> Vec<u8> {
        certificate_message(
            self.id,
            self.config_hash,
            self.issued_at,
            self.expiry,
            &self.dimensions,
            self.confidence_score,
            &self.audit_trail,
            &self.issuer,
        )
    }

    /// Signature is intact and was made by `key`
    #[must_use]
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        if self.issuer != hex::encode(key.as_bytes()) {
            return false;
        }
        let Ok(bytes) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);
        key.verify(&self.message(), &signature).is_ok()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Signed by `key` and not yet expired at `now`
    #[must_use]
    pub fn is_valid_at(&self, key: &VerifyingKey, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && self.verify(key)
    }
}

/// Issues certificates with one signing key
pub struct CertificateIssuer {
    signing_key: SigningKey,
    ttl_secs: u64,
}

impl std::fmt::Debug for CertificateIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateIssuer")
            .field("issuer", &hex::encode(self.verifying_key().as_bytes()))
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl CertificateIssuer {
    #[must_use]
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    /// Issuer with a fresh random key
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut csprng = OsRng;
        Self::new(SigningKey::generate(&mut csprng))
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Read a 32-byte key file, generating it on first use
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        if path.exists() {
            let bytes = std::fs::read(path).map_err(|e| ValidationError::io(path, e))?;
            let secret: [u8; 32] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ValidationError::Key {
                        path: path.to_path_buf(),
                        reason: format!("expected 32 bytes, found {}", bytes.len()),
                    })?;
            debug!(path = %path.display(), "loaded signing key");
            return Ok(Self::new(SigningKey::from_bytes(&secret)));
        }

        let issuer = Self::ephemeral();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| ValidationError::io(dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ValidationError::io(dir, e))?;
        tmp.write_all(&issuer.signing_key.to_bytes())
            .map_err(|e| ValidationError::io(path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ValidationError::io(path, e))?;
        }
        tmp.persist(path)
            .map_err(|e| ValidationError::io(path, e.error))?;
        info!(path = %path.display(), "generated signing key");
        Ok(issuer)
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    #[must_use]
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Sign a certificate for `report` issued now
    #[must_use]
    pub fn issue(&self, report: &ValidationReport, audit_trail: Vec<String>) -> Certificate {
        self.issue_at(report, audit_trail, Utc::now())
    }

    /// Sign a certificate for `report` issued at `issued_at`
    #[must_use]
    pub fn issue_at(
        &self,
        report: &ValidationReport,
        audit_trail: Vec<String>,
        issued_at: DateTime<Utc>,
    ) -> Certificate {
        let ttl = Duration::seconds(i64::try_from(self.ttl_secs.min(MAX_TTL_SECS)).unwrap_or_default());
        let expiry = issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut certificate = Certificate {
            id: Uuid::new_v4(),
            config_hash: report.config_hash,
            issued_at,
            expiry,
            dimensions: report.dimensions,
            confidence_score: report.overall,
            audit_trail,
            issuer: hex::encode(self.verifying_key().as_bytes()),
            signature: String::new(),
        };
        let signature: Signature = self.signing_key.sign(&certificate.message());
        certificate.signature = hex::encode(signature.to_bytes());
        certificate
    }
}
