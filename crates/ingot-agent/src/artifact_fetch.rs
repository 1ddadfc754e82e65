use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::{error::EngineError, error_payload::format_error_chain};

const ATTEMPTS: u32 = 3;

/// Downloads one binary artifact to a destination path.
pub trait ArtifactFetcher: Send + Sync {
    /// Resolves to the number of bytes written. `dest` is only replaced on success.
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<u64, EngineError>> + Send;
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("ingot-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .expect("failed to build reqwest client")
    })
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl HttpFetcher {
    async fn download_once(url: &str, tmp: &Path) -> anyhow::Result<u64> {
        let resp = http_client()
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url} (status)"))?;

        let mut f = tokio::fs::File::create(tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read response body chunk")?;
            f.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
        }
        f.flush().await?;
        f.sync_all().await.ok();
        Ok(written)
    }
}

impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, EngineError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::DownloadFailure(format!("create {}: {e}", parent.display())))?;
        }
        let tmp = part_path(dest);

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=ATTEMPTS {
            match Self::download_once(url, &tmp).await {
                Ok(n) => {
                    tokio::fs::rename(&tmp, dest)
                        .await
                        .map_err(|e| EngineError::DownloadFailure(format!("move into place: {e}")))?;
                    tracing::info!(url, dest = %dest.display(), bytes = n, "artifact downloaded");
                    return Ok(n);
                }
                Err(e) => {
                    tracing::warn!(url, attempt, error = %format_error_chain(&e), "download attempt failed");
                    last_err = Some(e);
                    if attempt < ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }

        let _ = tokio::fs::remove_file(&tmp).await;
        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("download failed"));
        Err(EngineError::DownloadFailure(format_error_chain(&err)))
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::StatusCode, routing::get};

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn downloads_into_place() {
        let base = serve(Router::new().route("/server.jar", get(|| async { vec![42u8; 4096] }))).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("root").join("server.jar");

        let n = HttpFetcher
            .fetch(&format!("{base}/server.jar"), &dest)
            .await
            .unwrap();
        assert_eq!(n, 4096);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![42u8; 4096]);
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn http_errors_become_download_failures() {
        let base = serve(Router::new().route("/missing", get(|| async { StatusCode::NOT_FOUND }))).await;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("server.jar");

        let err = HttpFetcher
            .fetch(&format!("{base}/missing"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DownloadFailure(_)));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
