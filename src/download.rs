//! Streaming downloads to the local work directory.
//!
//! Bytes land in `<name>.part` and the file is renamed only once the body
//! has been fully written, so a half-downloaded archive is never parsed.
//! `file://` URLs are copied, which lets fixtures and pre-fetched mirrors
//! run through the same path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};
use crate::models::AvailableFile;
use crate::traits::Fetcher;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadResult {
    pub url: String,
    pub success: bool,
    pub local_path: Option<PathBuf>,
    pub error: Option<String>,
    pub bytes: u64,
}

impl DownloadResult {
    pub fn ok(url: &str, local_path: PathBuf, bytes: u64) -> Self {
        Self {
            url: url.to_string(),
            success: true,
            local_path: Some(local_path),
            error: None,
            bytes,
        }
    }

    pub fn failed(url: &str, error: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            local_path: None,
            error: Some(error.to_string()),
            bytes: 0,
        }
    }
}

pub struct Downloader {
    client: reqwest::Client,
    dir: PathBuf,
}

impl Downloader {
    pub fn new(dir: impl Into<PathBuf>, connect_timeout_secs: u64) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .build()
            .map_err(|e| IngestError::Transient(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            dir: dir.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch `url` into the work directory as `filename` (default: last URL segment).
    pub async fn download(&self, url: &str, filename: Option<&str>) -> DownloadResult {
        let name = match filename.filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => url.rsplit('/').next().unwrap_or("download").to_string(),
        };
        let dest = self.dir.join(&name);
        let part = self.dir.join(format!("{}.part", name));

        match self.fetch_to(url, &part).await {
            Ok(bytes) => match tokio::fs::rename(&part, &dest).await {
                Ok(()) => {
                    debug!(url = %url, bytes, path = %dest.display(), "downloaded");
                    DownloadResult::ok(url, dest, bytes)
                }
                Err(e) => {
                    warn!(url = %url, path = %dest.display(), error = %e, "could not move download into place");
                    discard_partial(&part).await;
                    DownloadResult::failed(url, e)
                }
            },
            Err(e) => {
                discard_partial(&part).await;
                warn!(url = %url, error = %e, "download failed");
                DownloadResult::failed(url, e)
            }
        }
    }

    async fn fetch_to(&self, url: &str, part: &Path) -> IngestResult<u64> {
        tokio::fs::create_dir_all(&self.dir).await?;

        if let Some(source) = url.strip_prefix("file://") {
            return Ok(tokio::fs::copy(source, part).await?);
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IngestError::Transient(e.to_string()))?;

        let mut out = tokio::fs::File::create(part).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| IngestError::Transient(e.to_string()))?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}

async fn discard_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!(path = %part.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %part.display(), error = %e, "could not remove partial download"),
    }
}

#[async_trait]
impl Fetcher for Downloader {
    async fn fetch(&self, file: &AvailableFile) -> DownloadResult {
        self.download(&file.url, Some(file.filename())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_urls_are_copied() {
        let src_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("psc-snapshot-2024-01-01_1of1.zip");
        std::fs::write(&src, b"PK fake").unwrap();

        let dl = Downloader::new(work.path(), 5).unwrap();
        let result = dl
            .download(&format!("file://{}", src.display()), None)
            .await;
        assert!(result.success, "{:?}", result.error);
        let local = result.local_path.unwrap();
        assert_eq!(local, work.path().join("psc-snapshot-2024-01-01_1of1.zip"));
        assert_eq!(std::fs::read(local).unwrap(), b"PK fake");
        assert_eq!(result.bytes, 7);
    }

    #[tokio::test]
    async fn failures_leave_no_partial_file() {
        let work = tempfile::tempdir().unwrap();
        let dl = Downloader::new(work.path(), 5).unwrap();
        let result = dl.download("file:///definitely/missing.zip", None).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(result.local_path.is_none());
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_rename_removes_the_part_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("snapshot.zip");
        std::fs::write(&src, b"PK fake").unwrap();
        // A non-empty directory where the file should land blocks the rename.
        std::fs::create_dir_all(work.path().join("snapshot.zip").join("occupied")).unwrap();

        let dl = Downloader::new(work.path(), 5).unwrap();
        let result = dl
            .download(&format!("file://{}", src.display()), None)
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(!work.path().join("snapshot.zip.part").exists());
        assert!(work.path().join("snapshot.zip").is_dir());
    }
}
