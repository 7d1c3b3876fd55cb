// Manifest loading and fail-fast validation

use crate::errors::ValidationError;
use crate::executor::safety::is_within;
use crate::models::Manifest;
use std::path::Path;

/// Read and validate a manifest that must live under `secure_root`.
///
/// Nothing is executed on error: every entry is checked for a non-empty `id` and
/// `operationType` before the manifest is handed back.
pub async fn load_manifest(path: &Path, secure_root: &Path) -> Result<Manifest, ValidationError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(ValidationError::FileNotFound(path.display().to_string())),
    }

    if !is_within(path, secure_root).await {
        return Err(ValidationError::OutsideSecureRoot(path.display().to_string()));
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ValidationError::InvalidJson(format!("{}: {}", path.display(), e)))?;
    let manifest: Manifest = serde_json::from_str(&content)?;

    validate_entries(&manifest)?;
    Ok(manifest)
}

pub fn validate_entries(manifest: &Manifest) -> Result<(), ValidationError> {
    for (index, entry) in manifest.operations.iter().enumerate() {
        if entry.id.trim().is_empty() {
            return Err(ValidationError::MissingField(format!("operations[{}].id", index)));
        }
        if entry.operation_type.trim().is_empty() {
            return Err(ValidationError::MissingField(format!(
                "operations[{}].operationType",
                index
            )));
        }
    }
    Ok(())
}
