// Canonicalization and signing of operation records

pub mod canonical;
pub mod certificate;
pub mod signer;

pub use canonical::{canonical_json, to_canonical_string};
pub use certificate::{
    Certificate, CertificateStore, DirectoryCertificateStore, KeyUsage, MemoryCertificateStore,
    StoreLocation, CODE_SIGNING_OID,
};
pub use signer::{canonical_form, RecordSigner, ValidationOutcome, HASH_ALGORITHM, SIGNATURE_VERSION};

use crate::config::SigningSettings;
use std::sync::Arc;

/// Signer over the user and machine directory stores named in settings
pub fn signer_from_settings(settings: &SigningSettings) -> RecordSigner {
    let mut stores: Vec<Arc<dyn CertificateStore>> = Vec::new();
    if let Some(dir) = &settings.user_store_dir {
        stores.push(Arc::new(DirectoryCertificateStore::new(StoreLocation::CurrentUser, dir)));
    }
    if let Some(dir) = &settings.machine_store_dir {
        stores.push(Arc::new(DirectoryCertificateStore::new(StoreLocation::LocalMachine, dir)));
    }
    RecordSigner::new(stores)
}
