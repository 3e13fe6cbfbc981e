//! Archive fetching and integrity checks.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// User agent sent with HTTP downloads.
pub const USER_AGENT: &str = concat!("launch-readiness/", env!("CARGO_PKG_VERSION"));

/// Largest buffer reserved up front from an advertised `Content-Length`.
pub const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Progress callback: bytes received so far and the total when known.
pub type FetchProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Why an archive could not be fetched.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retrieves archive bytes from a URL.
#[async_trait]
pub trait ArchiveSource: Send + Sync + 'static {
    /// Fetch `url` into memory, reporting byte progress as it arrives.
    async fn fetch(&self, url: &str, on_progress: FetchProgress<'_>) -> Result<Vec<u8>, FetchError>;
}

/// Fetches `file://` URLs from disk and `http(s)://` URLs over the network.
#[derive(Debug, Clone, Default)]
pub struct DefaultArchiveSource {
    #[cfg(feature = "fetch-http")]
    client: reqwest::Client,
}

impl DefaultArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "fetch-http")]
    async fn fetch_http(
        &self,
        url: &str,
        on_progress: FetchProgress<'_>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let total = response.content_length();
        let mut body = Vec::with_capacity(initial_capacity(total));
        on_progress(0, total);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?
        {
            body.extend_from_slice(&chunk);
            on_progress(body.len() as u64, total);
        }
        Ok(body)
    }

    #[cfg(not(feature = "fetch-http"))]
    async fn fetch_http(
        &self,
        url: &str,
        _on_progress: FetchProgress<'_>,
    ) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::UnsupportedUrl(format!(
            "{url} (built without the fetch-http feature)"
        )))
    }
}

/// Buffer size to reserve for a body of advertised length `total`.
#[cfg_attr(not(feature = "fetch-http"), allow(dead_code))]
fn initial_capacity(total: Option<u64>) -> usize {
    let capped = total.unwrap_or(0).min(MAX_PREALLOCATION);
    usize::try_from(capped).unwrap_or(0)
}

#[async_trait]
impl ArchiveSource for DefaultArchiveSource {
    async fn fetch(&self, url: &str, on_progress: FetchProgress<'_>) -> Result<Vec<u8>, FetchError> {
        tracing::debug!(url = %url, "fetching archive");
        if let Some(path) = url.strip_prefix("file://") {
            let bytes = tokio::fs::read(PathBuf::from(path)).await?;
            let len = bytes.len() as u64;
            on_progress(len, Some(len));
            return Ok(bytes);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.fetch_http(url, on_progress).await;
        }
        Err(FetchError::UnsupportedUrl(url.to_string()))
    }
}

// ── Integrity ───────────────────────────────────────────────────────

/// Decides whether fetched bytes are the ones expected.
pub trait IntegrityCheck: Send + Sync {
    fn verify(&self, bytes: &[u8]) -> bool;
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compares against a known SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha256Integrity {
    expected: String,
}

impl Sha256Integrity {
    pub fn new(expected_hex: impl Into<String>) -> Self {
        Self {
            expected: expected_hex.into().trim().to_ascii_lowercase(),
        }
    }
}

impl IntegrityCheck for Sha256Integrity {
    fn verify(&self, bytes: &[u8]) -> bool {
        let actual = sha256_hex(bytes);
        if actual != self.expected {
            tracing::warn!(expected = %self.expected, actual = %actual, "checksum mismatch");
            return false;
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn integrity_ignores_case() {
        let check = Sha256Integrity::new(sha256_hex(b"runtime").to_uppercase());
        assert!(check.verify(b"runtime"));
        assert!(!check.verify(b"tampered"));
    }

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.tar");
        std::fs::write(&path, b"archive-bytes").unwrap();

        let seen = AtomicU64::new(0);
        let progress = |done: u64, _total: Option<u64>| seen.store(done, Ordering::SeqCst);
        let bytes = DefaultArchiveSource::new()
            .fetch(&format!("file://{}", path.display()), &progress)
            .await
            .unwrap();
        assert_eq!(bytes, b"archive-bytes");
        assert_eq!(seen.load(Ordering::SeqCst), 13);
    }

    #[test]
    fn advertised_length_reservation_is_capped() {
        assert_eq!(initial_capacity(None), 0);
        assert_eq!(initial_capacity(Some(1024)), 1024);
        assert_eq!(
            initial_capacity(Some(u64::MAX)),
            MAX_PREALLOCATION as usize
        );
    }

    #[tokio::test]
    async fn unknown_schemes_are_rejected() {
        let err = DefaultArchiveSource::new()
            .fetch("ftp://example.com/a.tar", &|_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedUrl(_)));
    }
}
