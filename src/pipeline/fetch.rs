//! Fetch stage: download the source PDF into the job's temp scope.
//!
//! pdfium needs a file-system path, so the body is written through the
//! [`TempScope`] and the path is handed to Render. The `%PDF` magic bytes are
//! checked before writing: an HTML error page served with `200 OK` is a
//! permanent failure here rather than a confusing pdfium error later.

use crate::config::IngestConfig;
use crate::error::{IngestError, StageError};
use crate::pipeline::suspend;
use crate::temp::TempScope;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-download limits, copied out of [`IngestConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

impl DownloadLimits {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_bytes: config.max_download_bytes,
            timeout: Duration::from_secs(config.download_timeout_secs),
        }
    }
}

/// Retrieves the raw bytes behind a URL.
///
/// Implementations classify their own failures: timeouts and connection
/// errors as [`StageError::DownloadTimeout`] / [`StageError::Connection`],
/// non-success responses as [`StageError::HttpStatus`].
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, limits: DownloadLimits) -> Result<Vec<u8>, StageError>;
}

/// [`Downloader`] over a shared `reqwest` client.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(config: &IngestConfig) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/pdf,application/octet-stream;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("ar,fr;q=0.9,en;q=0.8"),
        );

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .map_err(|e| IngestError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn fetch_body(&self, url: &str, limits: DownloadLimits) -> Result<Vec<u8>, StageError> {
        let max_bytes = limits.max_bytes;
        let secs = limits.timeout.as_secs();
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| connection_error(url, secs, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || StageError::TooLarge {
            url: url.to_string(),
            limit: max_bytes,
        };
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(too_large());
        }

        // Content-Length may be absent or wrong; enforce the cap while streaming.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| connection_error(url, secs, e))?
        {
            if body.len() as u64 + chunk.len() as u64 > max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, limits: DownloadLimits) -> Result<Vec<u8>, StageError> {
        match tokio::time::timeout(limits.timeout, self.fetch_body(url, limits)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::DownloadTimeout {
                url: url.to_string(),
                secs: limits.timeout.as_secs(),
            }),
        }
    }
}

fn connection_error(url: &str, secs: u64, e: reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::DownloadTimeout {
            url: url.to_string(),
            secs,
        }
    } else {
        StageError::Connection {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Reject anything that does not start with `%PDF`.
pub fn check_pdf_magic(bytes: &[u8]) -> Result<(), StageError> {
    if bytes.starts_with(b"%PDF") {
        Ok(())
    } else {
        Err(StageError::NotAPdf {
            magic: bytes.iter().take(4).copied().collect(),
        })
    }
}

/// Run the Fetch stage. Returns the path of the downloaded PDF.
pub async fn fetch(
    url: &str,
    downloader: &dyn Downloader,
    limits: DownloadLimits,
    scope: &TempScope,
    cancel: &CancellationToken,
) -> Result<PathBuf, StageError> {
    info!("Downloading PDF from: {}", url);

    let bytes = suspend(cancel, downloader.download(url, limits)).await?;
    if bytes.len() as u64 > limits.max_bytes {
        return Err(StageError::TooLarge {
            url: url.to_string(),
            limit: limits.max_bytes,
        });
    }
    check_pdf_magic(&bytes)?;

    let path = scope.write(&bytes, "pdf").await?;
    debug!(bytes = bytes.len(), path = %path.display(), "PDF stored");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::DiskTempStorage;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    struct Canned(Result<Vec<u8>, StageError>);

    #[async_trait]
    impl Downloader for Canned {
        async fn download(&self, _: &str, _: DownloadLimits) -> Result<Vec<u8>, StageError> {
            self.0.clone()
        }
    }

    fn limits() -> DownloadLimits {
        DownloadLimits {
            max_bytes: 1024,
            timeout: Duration::from_secs(5),
        }
    }

    fn scope() -> TempScope {
        TempScope::new(Arc::new(DiskTempStorage::new().unwrap()), Uuid::new_v4())
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(response).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}/doc.pdf")
    }

    #[test]
    fn magic_check() {
        assert!(check_pdf_magic(b"%PDF-1.7\n...").is_ok());
        assert_eq!(
            check_pdf_magic(b"<html>"),
            Err(StageError::NotAPdf {
                magic: b"<htm".to_vec()
            })
        );
        assert!(check_pdf_magic(b"").is_err());
    }

    #[tokio::test]
    async fn fetch_writes_pdf_into_scope() {
        let scope = scope();
        let dl = Canned(Ok(b"%PDF-1.4 body".to_vec()));
        let path = fetch("https://x/a.pdf", &dl, limits(), &scope, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(scope.read(&path).await.unwrap(), b"%PDF-1.4 body");
        assert_eq!(scope.len().await, 1);
        scope.release().await;
    }

    #[tokio::test]
    async fn fetch_rejects_html_without_writing() {
        let scope = scope();
        let dl = Canned(Ok(b"<!doctype html>".to_vec()));
        let err = fetch("https://x/a.pdf", &dl, limits(), &scope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::NotAPdf { .. }));
        assert!(scope.is_empty().await);
    }

    #[tokio::test]
    async fn fetch_passes_downloader_errors_through() {
        let scope = scope();
        let dl = Canned(Err(StageError::DownloadTimeout {
            url: "u".into(),
            secs: 40,
        }));
        let err = fetch("u", &dl, limits(), &scope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.kind().is_retryable());
    }

    #[tokio::test]
    async fn http_404_is_permanent() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let dl = HttpDownloader::new(&IngestConfig::default()).unwrap();
        let err = dl.download(&url, limits()).await.unwrap_err();
        assert!(matches!(err, StageError::HttpStatus { status: 404, .. }));
        assert!(!err.kind().is_retryable());
    }

    #[tokio::test]
    async fn http_body_over_cap_is_rejected() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2048\r\nConnection: close\r\n\r\n%PDF",
        )
        .await;
        let dl = HttpDownloader::new(&IngestConfig::default()).unwrap();
        let err = dl.download(&url, limits()).await.unwrap_err();
        assert!(matches!(err, StageError::TooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn http_success_returns_body() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/pdf\r\nContent-Length: 8\r\nConnection: close\r\n\r\n%PDF-1.7",
        )
        .await;
        let dl = HttpDownloader::new(&IngestConfig::default()).unwrap();
        assert_eq!(dl.download(&url, limits()).await.unwrap(), b"%PDF-1.7");
    }
}
