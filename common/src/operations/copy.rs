// copy-file handler

use crate::errors::OperationError;
use crate::models::CopyFile;
use crate::operations::resolver::SourceResolver;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct CopyFileHandler {
    resolver: Arc<SourceResolver>,
}

impl CopyFileHandler {
    pub fn new(resolver: Arc<SourceResolver>) -> Self {
        Self { resolver }
    }

    pub async fn execute(
        &self,
        operation: &CopyFile,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, OperationError> {
        let destination = Path::new(&operation.destination_path);

        // Checked before resolving so a refused copy never downloads anything
        if !operation.overwrite && tokio::fs::try_exists(destination).await? {
            return Err(OperationError::DestinationExists(
                operation.destination_path.clone(),
            ));
        }

        let source = self
            .resolver
            .resolve(
                &operation.source_path,
                operation.expected_checksum.as_deref(),
                cancel,
            )
            .await?;

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let copied = tokio::fs::copy(&source.path, destination).await;
        let source_display = source.path.display().to_string();
        source.release().await;
        let bytes = copied?;

        info!(source = %source_display, destination = %destination.display(), bytes, "File copied");
        Ok(Some(format!(
            "Copied {} to {} ({} bytes)",
            operation.source_path, operation.destination_path, bytes
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handler(dir: &Path) -> CopyFileHandler {
        CopyFileHandler::new(Arc::new(
            SourceResolver::new(dir.join("cache"), Duration::from_secs(5)).unwrap(),
        ))
    }

    fn operation(source: &Path, destination: &Path, overwrite: bool) -> CopyFile {
        CopyFile {
            source_path: source.display().to_string(),
            destination_path: destination.display().to_string(),
            overwrite,
            expected_checksum: None,
        }
    }

    #[tokio::test]
    async fn test_copy_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        let destination = dir.path().join("a").join("b").join("dst.txt");
        tokio::fs::write(&source, b"payload").await.unwrap();

        handler(dir.path())
            .execute(&operation(&source, &destination, false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_existing_destination_respects_overwrite_flag() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        let destination = dir.path().join("dst.txt");
        tokio::fs::write(&source, b"new").await.unwrap();
        tokio::fs::write(&destination, b"old").await.unwrap();

        let err = handler(dir.path())
            .execute(&operation(&source, &destination, false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::DestinationExists(_)));
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"old");

        handler(dir.path())
            .execute(&operation(&source, &destination, true), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = handler(dir.path())
            .execute(
                &operation(&dir.path().join("nope.txt"), &dir.path().join("dst.txt"), true),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Resolve(_)));
        assert!(!dir.path().join("dst.txt").exists());
    }
}
