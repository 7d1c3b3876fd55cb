// Operation file store: FILE-OPS.json, REG-OPS.json and DRIVE-OPS.json under one directory

use crate::errors::RecordFileError;
use crate::records::{OperationFamily, OperationRecord, SignableRecord};
use crate::signing::{Certificate, RecordSigner, ValidationOutcome};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Signature check result for one record of a file
#[derive(Debug, Clone)]
pub struct RecordAudit {
    pub id: String,
    pub display_name: String,
    pub outcome: ValidationOutcome,
}

#[derive(Debug)]
pub struct OperationFileStore {
    directory: PathBuf,
}

impl OperationFileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, family: OperationFamily) -> PathBuf {
        self.directory.join(family.file_name())
    }

    /// Records of one family; a missing file is an empty list
    pub async fn read<R: DeserializeOwned>(
        &self,
        family: OperationFamily,
    ) -> Result<Vec<R>, RecordFileError> {
        read_array(&self.path_for(family)).await
    }

    pub async fn read_records(
        &self,
        family: OperationFamily,
    ) -> Result<Vec<OperationRecord>, RecordFileError> {
        let values: Vec<Value> = self.read(family).await?;
        values
            .into_iter()
            .map(|value| OperationRecord::from_value(family, value).map_err(RecordFileError::from))
            .collect()
    }

    /// Write records pretty-printed, keeping the previous file as `<name>.bak`
    pub async fn write<R: SignableRecord>(
        &self,
        family: OperationFamily,
        records: &[R],
    ) -> Result<PathBuf, RecordFileError> {
        let path = self.path_for(family);
        write_array(&path, records).await?;
        info!(path = %path.display(), records = records.len(), family = %family, "Operation file written");
        Ok(path)
    }

    /// Sign every record, then write; nothing is written if any record fails to sign
    pub async fn write_signed<R: SignableRecord>(
        &self,
        family: OperationFamily,
        records: &mut [R],
        signer: &RecordSigner,
        certificate: &Certificate,
    ) -> Result<PathBuf, RecordFileError> {
        for record in records.iter_mut() {
            signer
                .try_sign(record, certificate)
                .map_err(|source| RecordFileError::Signing {
                    id: record.record_id().to_string(),
                    source,
                })?;
        }
        self.write(family, records).await
    }

    /// Validate the signature of every record in a family file
    pub async fn audit(
        &self,
        family: OperationFamily,
        signer: &RecordSigner,
    ) -> Result<Vec<RecordAudit>, RecordFileError> {
        let records = self.read_records(family).await?;
        let audits: Vec<RecordAudit> = records
            .iter()
            .map(|record| RecordAudit {
                id: record.record_id().to_string(),
                display_name: record.display_name(),
                outcome: signer.validate(record),
            })
            .collect();

        let invalid = audits.iter().filter(|a| !a.outcome.is_valid()).count();
        if invalid > 0 {
            warn!(family = %family, total = audits.len(), invalid, "Operation file contains invalid records");
        } else {
            debug!(family = %family, total = audits.len(), "Operation file signatures verified");
        }
        Ok(audits)
    }
}

/// Read a JSON array file; a missing file is an empty list
pub async fn read_array<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, RecordFileError> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Operation file missing; treating as empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&body)?)
}

/// Write a JSON array through a temporary file, backing up the previous version
pub async fn write_array<R: serde::Serialize>(
    path: &Path,
    records: &[R],
) -> Result<(), RecordFileError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::try_exists(path).await? {
        let backup = sibling_with_suffix(path, ".bak");
        tokio::fs::copy(path, &backup).await?;
    }

    let body = serde_json::to_string_pretty(records)?;
    let staging = sibling_with_suffix(path, ".tmp");
    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DriveOperation, FileOperation, RecordHeader, SignatureBlock};
    use crate::signing::{MemoryCertificateStore, StoreLocation};
    use chrono::{Duration, Utc};
    use rsa::RsaPrivateKey;
    use serde_json::Map;
    use std::sync::Arc;

    fn drive(id: &str, letter: &str) -> DriveOperation {
        DriveOperation {
            header: RecordHeader::new(id),
            drive_letter: letter.to_string(),
            drive_path: "\\\\srv\\share".to_string(),
            reconnect: true,
            delete: false,
            hidden: false,
            signature: SignatureBlock::default(),
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperationFileStore::new(dir.path());
        let records: Vec<FileOperation> = store.read(OperationFamily::File).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_write_keeps_backup_of_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperationFileStore::new(dir.path());

        store.write(OperationFamily::Drive, &[drive("1", "F:")]).await.unwrap();
        store
            .write(OperationFamily::Drive, &[drive("1", "F:"), drive("2", "G:")])
            .await
            .unwrap();

        let current: Vec<DriveOperation> = store.read(OperationFamily::Drive).await.unwrap();
        assert_eq!(current.len(), 2);

        let backup: Vec<DriveOperation> =
            read_array(&dir.path().join("DRIVE-OPS.json.bak")).await.unwrap();
        assert_eq!(backup.len(), 1);
        assert_eq!(backup[0].drive_letter, "F:");
        assert!(!dir.path().join("DRIVE-OPS.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_signed_then_audit() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperationFileStore::new(dir.path());

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let now = Utc::now();
        let cert = Certificate::from_private_key(
            "CN=Store",
            now - Duration::days(1),
            now + Duration::days(1),
            key,
        )
        .unwrap();
        let signer = RecordSigner::new(vec![Arc::new(MemoryCertificateStore::with_certificates(
            StoreLocation::LocalMachine,
            vec![cert.clone()],
        ))]);

        let mut records = vec![drive("1", "F:"), drive("2", "G:")];
        store
            .write_signed(OperationFamily::Drive, &mut records, &signer, &cert)
            .await
            .unwrap();

        let audits = store.audit(OperationFamily::Drive, &signer).await.unwrap();
        assert_eq!(audits.len(), 2);
        assert!(audits.iter().all(|a| a.outcome.is_valid()));

        // Edit one record on disk behind the signer's back
        let path = store.path_for(OperationFamily::Drive);
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, body.replace("G:", "H:")).await.unwrap();

        let audits = store.audit(OperationFamily::Drive, &signer).await.unwrap();
        assert!(audits[0].outcome.is_valid());
        assert!(!audits[1].outcome.is_valid());
        assert_eq!(audits[1].display_name, "[2] H: → \\\\srv\\share");
    }
}
