// Record signer: canonicalize, sign and validate operation records

use crate::errors::{IntegrityError, SigningError};
use crate::records::SignableRecord;
use crate::signing::canonical::to_canonical_string;
use crate::signing::certificate::{normalize_thumbprint, Certificate, CertificateStore};
use crate::telemetry;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

pub const HASH_ALGORITHM: &str = "SHA256";
pub const SIGNATURE_VERSION: &str = "1.0";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Result of checking a record's signature
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Valid {
        certificate: Certificate,
        signed_at: Option<String>,
    },
    Invalid(IntegrityError),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid { .. })
    }

    pub fn error(&self) -> Option<&IntegrityError> {
        match self {
            ValidationOutcome::Valid { .. } => None,
            ValidationOutcome::Invalid(e) => Some(e),
        }
    }
}

/// Canonical text of `record` with its signature block removed
pub fn canonical_form<R: SignableRecord>(record: &R) -> Result<String, serde_json::Error> {
    let mut unsigned = record.clone();
    unsigned.signature_block_mut().clear();
    to_canonical_string(&unsigned)
}

/// Signs records and validates them against certificates found in the configured stores
pub struct RecordSigner {
    stores: Vec<Arc<dyn CertificateStore>>,
    cache: RwLock<HashMap<String, Certificate>>,
}

impl RecordSigner {
    /// Stores are searched in order; user scope first by convention
    pub fn new(stores: Vec<Arc<dyn CertificateStore>>) -> Self {
        Self {
            stores,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Sign `record`, returning false and leaving it unsigned on any failure
    pub fn sign<R: SignableRecord>(&self, record: &mut R, certificate: &Certificate) -> bool {
        match self.try_sign(record, certificate) {
            Ok(()) => {
                info!(record = %record.display_name(), thumbprint = %certificate.thumbprint(), "Record signed");
                true
            }
            Err(e) => {
                error!(record = %record.display_name(), error = %e, "Failed to sign record");
                false
            }
        }
    }

    pub fn try_sign<R: SignableRecord>(
        &self,
        record: &mut R,
        certificate: &Certificate,
    ) -> Result<(), SigningError> {
        self.sign_at(record, certificate, Utc::now())
    }

    /// Sign with an explicit timestamp
    pub fn sign_at<R: SignableRecord>(
        &self,
        record: &mut R,
        certificate: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        record.signature_block_mut().clear();
        let private_key = certificate
            .private_key()
            .ok_or(SigningError::MissingPrivateKey)?;

        let canonical = canonical_form(record)?;
        let digest = Sha256::digest(canonical.as_bytes());
        let signature = private_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;

        let block = record.signature_block_mut();
        block.signature = Some(BASE64.encode(signature));
        block.timestamp = Some(at.format(TIMESTAMP_FORMAT).to_string());
        block.signer_thumbprint = Some(certificate.thumbprint().to_string());
        block.hash_algorithm = Some(HASH_ALGORITHM.to_string());
        block.signature_version = Some(SIGNATURE_VERSION.to_string());
        Ok(())
    }

    /// Check that `record` is signed by a known certificate and unchanged since signing
    pub fn validate<R: SignableRecord>(&self, record: &R) -> ValidationOutcome {
        let outcome = self.check(record);
        telemetry::record_signature_validation(outcome.is_valid());
        match &outcome {
            ValidationOutcome::Valid { certificate, .. } => {
                debug!(record = %record.display_name(), signer = %certificate.subject(), "Signature valid");
            }
            ValidationOutcome::Invalid(e) => {
                warn!(record = %record.display_name(), error = %e, "Signature validation failed");
            }
        }
        outcome
    }

    fn check<R: SignableRecord>(&self, record: &R) -> ValidationOutcome {
        let block = record.signature_block();
        if !block.is_signed() {
            return ValidationOutcome::Invalid(IntegrityError::NotSigned);
        }
        let (Some(signature), Some(thumbprint)) = (&block.signature, &block.signer_thumbprint)
        else {
            return ValidationOutcome::Invalid(IntegrityError::NotSigned);
        };

        if let Some(algorithm) = block.hash_algorithm.as_deref() {
            if !algorithm.eq_ignore_ascii_case(HASH_ALGORITHM) {
                return ValidationOutcome::Invalid(IntegrityError::UnsupportedAlgorithm(
                    algorithm.to_string(),
                ));
            }
        }

        let certificate = match self.find_certificate(thumbprint) {
            Some(certificate) => certificate,
            None => {
                return ValidationOutcome::Invalid(IntegrityError::CertificateNotFound(
                    thumbprint.clone(),
                ))
            }
        };

        let signature = match BASE64.decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(e) => return ValidationOutcome::Invalid(IntegrityError::MalformedSignature(e.to_string())),
        };

        let canonical = match canonical_form(record) {
            Ok(canonical) => canonical,
            Err(e) => return ValidationOutcome::Invalid(IntegrityError::Canonicalization(e.to_string())),
        };
        let digest = Sha256::digest(canonical.as_bytes());

        match certificate
            .public_key()
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        {
            Ok(()) => ValidationOutcome::Valid {
                certificate,
                signed_at: block.timestamp.clone(),
            },
            Err(_) => ValidationOutcome::Invalid(IntegrityError::SignatureMismatch),
        }
    }

    /// Look up a certificate by thumbprint: cache first, then each store, caching on hit
    pub fn find_certificate(&self, thumbprint: &str) -> Option<Certificate> {
        let key = normalize_thumbprint(thumbprint);

        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Some(cached.clone());
        }

        for store in &self.stores {
            match store.find_by_thumbprint(&key) {
                Ok(Some(certificate)) => {
                    self.cache
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key, certificate.clone());
                    return Some(certificate);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(store = %store.location(), error = %e, "Certificate store lookup failed");
                }
            }
        }

        None
    }

    pub fn list_signing_certificates(&self) -> Vec<Certificate> {
        self.list_signing_certificates_at(Utc::now())
    }

    /// Signing-capable certificates across all stores, deduplicated and sorted by subject
    pub fn list_signing_certificates_at(&self, at: DateTime<Utc>) -> Vec<Certificate> {
        let mut found: HashMap<String, Certificate> = HashMap::new();

        for store in &self.stores {
            let certificates = match store.certificates() {
                Ok(certificates) => certificates,
                Err(e) => {
                    warn!(store = %store.location(), error = %e, "Failed to enumerate certificate store");
                    continue;
                }
            };
            for certificate in certificates {
                if certificate.is_signing_candidate(at) {
                    found
                        .entry(certificate.thumbprint().to_string())
                        .or_insert(certificate);
                }
            }
        }

        let mut certificates: Vec<Certificate> = found.into_values().collect();
        certificates.sort_by(|a, b| {
            a.subject()
                .cmp(b.subject())
                .then_with(|| a.thumbprint().cmp(b.thumbprint()))
        });
        certificates
    }
}
