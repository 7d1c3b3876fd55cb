// Shared source resolver for install-package and copy-file
// A source is either an existing local file or an http(s) URI downloaded into a private cache.

use crate::errors::ResolveError;
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FALLBACK_FILE_NAME: &str = "downloaded_file";

/// A source ready to be consumed by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub path: PathBuf,
    /// True when the file lives in the download cache and belongs to us
    pub downloaded: bool,
}

impl ResolvedSource {
    /// Remove a downloaded file once the handler is done with it; local sources are left alone
    pub async fn release(self) {
        if !self.downloaded {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!(path = %self.path.display(), error = %e, "Could not remove cached download");
        }
    }
}

pub struct SourceResolver {
    client: Client,
    cache_dir: PathBuf,
}

impl SourceResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, ResolveError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ResolveError::DownloadFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve `source` to a local file, verifying `expected_checksum` when given
    #[tracing::instrument(skip(self, cancel))]
    pub async fn resolve(
        &self,
        source: &str,
        expected_checksum: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSource, ResolveError> {
        let local = Path::new(source);
        if matches!(tokio::fs::metadata(local).await, Ok(meta) if meta.is_file()) {
            if let Some(expected) = expected_checksum {
                verify_checksum(local, expected).await?;
            }
            return Ok(ResolvedSource {
                path: local.to_path_buf(),
                downloaded: false,
            });
        }

        let url = match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return Err(ResolveError::UnsupportedSource(source.to_string())),
        };

        let path = self.download(&url, cancel).await?;

        if let Some(expected) = expected_checksum {
            if let Err(e) = verify_checksum(&path, expected).await {
                warn!(url = %url, path = %path.display(), error = %e, "Downloaded file failed checksum verification");
                remove_quietly(&path).await;
                return Err(e);
            }
        }

        Ok(ResolvedSource {
            path,
            downloaded: true,
        })
    }

    async fn download(&self, url: &Url, cancel: &CancellationToken) -> Result<PathBuf, ResolveError> {
        self.prepare_cache_dir().await?;
        let path = self.cache_dir.join(cache_file_name(url));

        info!(url = %url, path = %path.display(), "Downloading source");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolveError::Cancelled),
            result = self.fetch_to(url, &path) => result,
        };

        if let Err(e) = result {
            remove_quietly(&path).await;
            return Err(e);
        }

        Ok(path)
    }

    async fn fetch_to(&self, url: &Url, path: &Path) -> Result<(), ResolveError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ResolveError::DownloadFailed(e.to_string()))?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ResolveError::DownloadFailed(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url = %url, bytes = written, "Download complete");
        Ok(())
    }

    async fn prepare_cache_dir(&self) -> Result<(), ResolveError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.cache_dir, std::fs::Permissions::from_mode(0o700))
                .await?;
        }

        Ok(())
    }
}

/// Unique cache file name derived from the last URI path segment
fn cache_file_name(url: &Url) -> String {
    let name: String = url
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    let name = if name.is_empty() || name.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name
    };

    format!("{}_{}", Uuid::new_v4().simple(), name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

/// Lower-case hex SHA-256 of a file, read in chunks
pub async fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file's digest with `expected`, ignoring case and surrounding whitespace
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), ResolveError> {
    let actual = sha256_file(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ResolveError::ChecksumMismatch {
            expected: expected.trim().to_string(),
            actual,
        })
    }
}
