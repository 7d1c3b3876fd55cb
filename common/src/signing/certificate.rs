// Signing certificates and the stores they are discovered in

use crate::errors::SigningError;
use chrono::{DateTime, Duration, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Extended key usage OID for code signing
pub const CODE_SIGNING_OID: &str = "1.3.6.1.5.5.7.3.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
}

/// Scope a store belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreLocation {
    CurrentUser,
    LocalMachine,
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::CurrentUser => f.write_str("CurrentUser"),
            StoreLocation::LocalMachine => f.write_str("LocalMachine"),
        }
    }
}

/// An RSA signing certificate.
///
/// `key_usage` and `extended_key_usage` are `None` when the corresponding extension
/// is absent, which is distinct from an extension listing nothing.
#[derive(Clone)]
pub struct Certificate {
    subject: String,
    thumbprint: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    key_usage: Option<Vec<KeyUsage>>,
    extended_key_usage: Option<Vec<String>>,
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
}

impl Certificate {
    pub fn new(
        subject: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        public_key: RsaPublicKey,
    ) -> Result<Self, SigningError> {
        let thumbprint = thumbprint_of(&public_key)?;
        Ok(Self {
            subject: subject.into(),
            thumbprint,
            not_before,
            not_after,
            key_usage: None,
            extended_key_usage: None,
            public_key,
            private_key: None,
        })
    }

    /// Certificate around an existing key pair, flagged for code signing
    pub fn from_private_key(
        subject: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        private_key: RsaPrivateKey,
    ) -> Result<Self, SigningError> {
        let public_key = private_key.to_public_key();
        Ok(Self::new(subject, not_before, not_after, public_key)?
            .with_key_usage(vec![KeyUsage::DigitalSignature])
            .with_extended_key_usage(vec![CODE_SIGNING_OID.to_string()])
            .with_private_key(private_key)?)
    }

    /// Fresh key pair valid from now for `valid_for`
    pub fn generate(
        subject: impl Into<String>,
        valid_for: Duration,
        bits: usize,
    ) -> Result<Self, SigningError> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        let now = Utc::now();
        Self::from_private_key(subject, now, now + valid_for, private_key)
    }

    /// Attach the private key; it must belong to this certificate's public key
    pub fn with_private_key(mut self, private_key: RsaPrivateKey) -> Result<Self, SigningError> {
        if private_key.to_public_key() != self.public_key {
            return Err(SigningError::KeyMismatch);
        }
        self.private_key = Some(private_key);
        Ok(self)
    }

    pub fn with_key_usage(mut self, usages: Vec<KeyUsage>) -> Self {
        self.key_usage = Some(usages);
        self
    }

    pub fn with_extended_key_usage(mut self, oids: Vec<String>) -> Self {
        self.extended_key_usage = Some(oids);
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Upper-case hex SHA-1 of the DER public key
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private_key.as_ref()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    /// Code-signing EKU when the extension is present, otherwise the digital-signature key usage
    pub fn allows_code_signing(&self) -> bool {
        match &self.extended_key_usage {
            Some(oids) => oids.iter().any(|oid| oid == CODE_SIGNING_OID),
            None => self
                .key_usage
                .as_ref()
                .is_some_and(|usages| usages.contains(&KeyUsage::DigitalSignature)),
        }
    }

    /// Usable for signing at `at`: private key present, in validity window, signing usage
    pub fn is_signing_candidate(&self, at: DateTime<Utc>) -> bool {
        self.has_private_key() && self.is_valid_at(at) && self.allows_code_signing()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("thumbprint", &self.thumbprint)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key_usage", &self.key_usage)
            .field("extended_key_usage", &self.extended_key_usage)
            .field("has_private_key", &self.has_private_key())
            .finish()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.thumbprint == other.thumbprint
    }
}

fn thumbprint_of(public_key: &RsaPublicKey) -> Result<String, SigningError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| SigningError::KeyEncoding(e.to_string()))?;
    Ok(hex::encode_upper(Sha1::digest(der.as_bytes())))
}

/// Thumbprints compare without case, whitespace or colon separators
pub fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Host-provided enumerable certificate store
pub trait CertificateStore: Send + Sync {
    fn location(&self) -> StoreLocation;

    fn certificates(&self) -> Result<Vec<Certificate>, SigningError>;

    fn find_by_thumbprint(&self, thumbprint: &str) -> Result<Option<Certificate>, SigningError> {
        let wanted = normalize_thumbprint(thumbprint);
        Ok(self
            .certificates()?
            .into_iter()
            .find(|cert| cert.thumbprint() == wanted))
    }
}

/// Store backed by a list held in memory
pub struct MemoryCertificateStore {
    location: StoreLocation,
    certificates: RwLock<Vec<Certificate>>,
}

impl MemoryCertificateStore {
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            certificates: RwLock::new(Vec::new()),
        }
    }

    pub fn with_certificates(location: StoreLocation, certificates: Vec<Certificate>) -> Self {
        Self {
            location,
            certificates: RwLock::new(certificates),
        }
    }

    pub fn add(&self, certificate: Certificate) {
        let mut certificates = self
            .certificates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        certificates.retain(|existing| existing.thumbprint() != certificate.thumbprint());
        certificates.push(certificate);
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn location(&self) -> StoreLocation {
        self.location
    }

    fn certificates(&self) -> Result<Vec<Certificate>, SigningError> {
        Ok(self
            .certificates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}

/// On-disk form of a certificate in a [`DirectoryCertificateStore`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDescriptor {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_usage: Option<Vec<KeyUsage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_key_usage: Option<Vec<String>>,
    /// SPKI PEM
    pub public_key_pem: String,
    /// PKCS#8 PEM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
}

impl CertificateDescriptor {
    pub fn from_certificate(cert: &Certificate) -> Result<Self, SigningError> {
        let public_key_pem = cert
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SigningError::KeyEncoding(e.to_string()))?;
        let private_key_pem = cert
            .private_key()
            .map(|key| {
                key.to_pkcs8_pem(LineEnding::LF)
                    .map(|pem| pem.to_string())
                    .map_err(|e| SigningError::KeyEncoding(e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            subject: cert.subject().to_string(),
            not_before: cert.not_before(),
            not_after: cert.not_after(),
            key_usage: cert.key_usage.clone(),
            extended_key_usage: cert.extended_key_usage.clone(),
            public_key_pem,
            private_key_pem,
        })
    }

    pub fn into_certificate(self) -> Result<Certificate, SigningError> {
        let public_key = RsaPublicKey::from_public_key_pem(&self.public_key_pem)
            .map_err(|e| SigningError::KeyEncoding(e.to_string()))?;
        let mut cert = Certificate::new(self.subject, self.not_before, self.not_after, public_key)?;
        cert.key_usage = self.key_usage;
        cert.extended_key_usage = self.extended_key_usage;

        match self.private_key_pem {
            Some(pem) => {
                let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                    .map_err(|e| SigningError::KeyEncoding(e.to_string()))?;
                cert.with_private_key(private_key)
            }
            None => Ok(cert),
        }
    }
}

/// Store reading one JSON descriptor per certificate from a directory
pub struct DirectoryCertificateStore {
    location: StoreLocation,
    directory: PathBuf,
}

impl DirectoryCertificateStore {
    pub fn new(location: StoreLocation, directory: impl Into<PathBuf>) -> Self {
        Self {
            location,
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write `cert` as `<thumbprint>.json`, replacing any previous copy
    pub fn install(&self, cert: &Certificate) -> Result<PathBuf, SigningError> {
        std::fs::create_dir_all(&self.directory).map_err(|e| SigningError::Store(e.to_string()))?;

        let descriptor = CertificateDescriptor::from_certificate(cert)?;
        let path = self.directory.join(format!("{}.json", cert.thumbprint()));
        let body = serde_json::to_string_pretty(&descriptor)?;
        std::fs::write(&path, body).map_err(|e| SigningError::Store(e.to_string()))?;

        #[cfg(unix)]
        if cert.has_private_key() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SigningError::Store(e.to_string()))?;
        }

        debug!(thumbprint = %cert.thumbprint(), path = %path.display(), "Certificate installed");
        Ok(path)
    }
}

impl CertificateStore for DirectoryCertificateStore {
    fn location(&self) -> StoreLocation {
        self.location
    }

    fn certificates(&self) -> Result<Vec<Certificate>, SigningError> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SigningError::Store(e.to_string())),
        };

        let mut certificates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let loaded = std::fs::read_to_string(&path)
                .map_err(|e| SigningError::Store(e.to_string()))
                .and_then(|body| Ok(serde_json::from_str::<CertificateDescriptor>(&body)?))
                .and_then(CertificateDescriptor::into_certificate);
            match loaded {
                Ok(cert) => certificates.push(cert),
                Err(e) => {
                    warn!(path = %path.display(), store = %self.location, error = %e, "Skipping unreadable certificate")
                }
            }
        }

        Ok(certificates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
    }

    fn certificate(subject: &str) -> Certificate {
        let now = Utc::now();
        Certificate::from_private_key(
            subject,
            now - Duration::days(1),
            now + Duration::days(30),
            test_key().clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_thumbprint_is_upper_hex_sha1() {
        let cert = certificate("CN=Test");
        assert_eq!(cert.thumbprint().len(), 40);
        assert!(cert
            .thumbprint()
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(normalize_thumbprint("ab:cd ef"), "ABCDEF");
    }

    #[test]
    fn test_signing_capability_rules() {
        let now = Utc::now();
        let public = test_key().to_public_key();
        let base = Certificate::new("CN=X", now - Duration::days(1), now + Duration::days(1), public)
            .unwrap();

        // EKU present without code signing wins over a digital-signature key usage
        let eku_without_code_signing = base
            .clone()
            .with_key_usage(vec![KeyUsage::DigitalSignature])
            .with_extended_key_usage(vec!["1.3.6.1.5.5.7.3.1".to_string()]);
        assert!(!eku_without_code_signing.allows_code_signing());

        let key_usage_only = base.clone().with_key_usage(vec![KeyUsage::DigitalSignature]);
        assert!(key_usage_only.allows_code_signing());
        assert!(!key_usage_only.is_signing_candidate(now));

        assert!(!base.allows_code_signing());
    }

    #[test]
    fn test_validity_window() {
        let cert = certificate("CN=Window");
        assert!(cert.is_valid_at(Utc::now()));
        assert!(!cert.is_valid_at(Utc::now() + Duration::days(60)));
        assert!(cert.is_signing_candidate(Utc::now()));
    }

    #[test]
    fn test_mismatched_private_key_is_rejected() {
        let now = Utc::now();
        let other = RsaPrivateKey::new(&mut rand::thread_rng(), 512).unwrap();
        let result = Certificate::new("CN=X", now, now, other.to_public_key())
            .unwrap()
            .with_private_key(test_key().clone());
        assert!(matches!(result, Err(SigningError::KeyMismatch)));
    }

    #[test]
    fn test_directory_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCertificateStore::new(StoreLocation::CurrentUser, dir.path());
        let cert = certificate("CN=Disk");

        store.install(&cert).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let loaded = store.certificates().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].thumbprint(), cert.thumbprint());
        assert!(loaded[0].has_private_key());
        assert!(loaded[0].allows_code_signing());

        let found = store
            .find_by_thumbprint(&cert.thumbprint().to_lowercase())
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_missing_directory_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCertificateStore::new(StoreLocation::LocalMachine, dir.path().join("none"));
        assert!(store.certificates().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_replaces_same_thumbprint() {
        let store = MemoryCertificateStore::new(StoreLocation::CurrentUser);
        store.add(certificate("CN=One"));
        store.add(certificate("CN=Two"));
        let certs = store.certificates().unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].subject(), "CN=Two");
    }
}
