//! Streaming downloads
//!
//! [`download_file`] copies an HTTP resource to disk in 1 MiB chunks,
//! reporting progress after each chunk and checking for cancellation at
//! every chunk boundary. A failed or cancelled transfer never leaves a
//! partial file behind.
//!
//! [`VersionDownloader`] combines the protocol client with a transfer. The
//! anonymous downloader sends no user ticket; the user downloader waits for
//! the shared [`UserAuthorization`] before its first request.

use crate::protocol::ProtocolClient;
use crate::token::UserAuthorization;
use crate::{Error, Result};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of the write (and progress report) unit
pub const CHUNK_SIZE: usize = 1024 * 1024;

const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Progress sink: `(bytes_transferred, total_bytes)`
pub type TransferProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Download `url` to `dest`
///
/// Returns the number of bytes written. On error or cancellation the
/// destination file is removed.
pub async fn download_file(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: TransferProgress<'_>,
    cancel: &CancellationToken,
) -> Result<u64> {
    download_file_with_timeout(http, url, dest, progress, cancel, DEFAULT_INACTIVITY_TIMEOUT).await
}

/// [`download_file`] with an explicit inactivity timeout
pub async fn download_file_with_timeout(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: TransferProgress<'_>,
    cancel: &CancellationToken,
    inactivity_timeout: Duration,
) -> Result<u64> {
    let result = stream_to_file(http, url, dest, progress, cancel, inactivity_timeout).await;
    if result.is_err() && dest.exists() {
        if let Err(e) = tokio::fs::remove_file(dest).await {
            warn!("Failed to remove partial download {}: {}", dest.display(), e);
        }
    }
    result
}

async fn stream_to_file(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: TransferProgress<'_>,
    cancel: &CancellationToken,
    inactivity_timeout: Duration,
) -> Result<u64> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        response = http.get(url).send() => response?,
    };
    let response = response.error_for_status()?;
    let total = response.content_length();

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut transferred: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            next = tokio::time::timeout(inactivity_timeout, stream.next()) => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk?,
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Transport(format!(
                    "no data received for {} seconds ({} bytes transferred)",
                    inactivity_timeout.as_secs(),
                    transferred
                )))
            }
        };

        let mut data = chunk.as_ref();
        while !data.is_empty() {
            let take = (CHUNK_SIZE - buffer.len()).min(data.len());
            buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if buffer.len() == CHUNK_SIZE {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                file.write_all(&buffer).await?;
                transferred += buffer.len() as u64;
                buffer.clear();
                progress(transferred, total);
            }
        }
    }

    if !buffer.is_empty() {
        file.write_all(&buffer).await?;
        transferred += buffer.len() as u64;
        progress(transferred, total);
    }
    file.flush().await?;

    if let Some(total) = total {
        if transferred != total {
            return Err(Error::Transport(format!(
                "connection closed after {} of {} bytes",
                transferred, total
            )));
        }
    }

    Ok(transferred)
}

/// Resolves version identifiers and downloads the resulting files
pub struct VersionDownloader {
    http: reqwest::Client,
    protocol: ProtocolClient,
    authorization: Option<Arc<UserAuthorization>>,
    inactivity_timeout: Duration,
}

impl VersionDownloader {
    /// Downloader that sends only the anonymous ticket
    pub fn anonymous(http: reqwest::Client, protocol: ProtocolClient) -> Self {
        Self {
            http,
            protocol,
            authorization: None,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    /// Downloader that attaches the user ticket once authorization completes
    pub fn user(
        http: reqwest::Client,
        protocol: ProtocolClient,
        authorization: Arc<UserAuthorization>,
    ) -> Self {
        Self {
            http,
            protocol,
            authorization: Some(authorization),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn is_user(&self) -> bool {
        self.authorization.is_some()
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn client(&self) -> Result<ProtocolClient> {
        match &self.authorization {
            Some(authorization) => {
                debug!("Waiting for authentication");
                let ticket = authorization.ticket().await?;
                debug!("Authentication complete");
                Ok(self.protocol.clone().with_user_ticket(ticket))
            }
            None => Ok(self.protocol.clone()),
        }
    }

    /// Resolve an identifier to a direct URL without downloading
    pub async fn resolve_download_url(
        &self,
        identifier: &str,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let client = self.client().await?;
        client.resolve(&self.http, identifier, revision, cancel).await
    }

    /// Resolve an identifier and download the file to `dest`
    pub async fn download(
        &self,
        identifier: &str,
        revision: &str,
        dest: &Path,
        progress: TransferProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let url = self.resolve_download_url(identifier, revision, cancel).await?;
        info!("Downloading {} to {}", identifier, dest.display());
        self.download_url(&url, dest, progress, cancel).await
    }

    pub async fn download_url(
        &self,
        url: &str,
        dest: &Path,
        progress: TransferProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        download_file_with_timeout(&self.http, url, dest, progress, cancel, self.inactivity_timeout)
            .await
    }

    /// Try pre-resolved URLs in order until one transfers completely
    pub async fn download_first_available(
        &self,
        urls: &[String],
        dest: &Path,
        progress: TransferProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut last_error = None;
        for url in urls {
            match self.download_url(url, dest, progress, cancel).await {
                Ok(bytes) => return Ok(bytes),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Download from {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Other("No download URLs available".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn recorder() -> (Arc<Mutex<Vec<(u64, Option<u64>)>>>, impl Fn(u64, Option<u64>) + Send + Sync)
    {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        (calls, move |done, total| sink.lock().unwrap().push((done, total)))
    }

    #[tokio::test]
    async fn test_download_reports_per_chunk() {
        let body = vec![7u8; CHUNK_SIZE * 2 + 10];
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/file")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let (calls, progress) = recorder();

        let written = download_file(
            &reqwest::Client::new(),
            &format!("{}/file", server.url()),
            &dest,
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        let calls = calls.lock().unwrap();
        let done: Vec<u64> = calls.iter().map(|c| c.0).collect();
        assert_eq!(
            done,
            vec![CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64, body.len() as u64]
        );
        assert!(calls.iter().all(|c| c.1 == Some(body.len() as u64)));
    }

    #[tokio::test]
    async fn test_error_status_leaves_no_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let (_, progress) = recorder();
        let result = download_file(
            &reqwest::Client::new(),
            &format!("{}/missing", server.url()),
            &dest,
            &progress,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Http(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_removes_file() {
        let body = vec![1u8; CHUNK_SIZE * 3];
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let cancel = CancellationToken::new();
        let cancel_after_first = cancel.clone();
        let progress = move |_done: u64, _total: Option<u64>| cancel_after_first.cancel();

        let result = download_file(
            &reqwest::Client::new(),
            &format!("{}/big", server.url()),
            &dest,
            &progress,
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_first_available_skips_failures() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/a").with_status(500).create_async().await;
        server
            .mock("GET", "/b")
            .with_status(200)
            .with_body("payload")
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.bin");
        let (_, progress) = recorder();
        let downloader = VersionDownloader::anonymous(
            reqwest::Client::new(),
            ProtocolClient::new(server.url(), crate::protocol::UrlPolicy::AnyHttp),
        );

        let urls = vec![format!("{}/a", server.url()), format!("{}/b", server.url())];
        let written = downloader
            .download_first_available(&urls, &dest, &progress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_user_downloader_propagates_auth_failure() {
        use crate::token::{TokenError, TokenSource};

        struct NoAccount;
        impl TokenSource for NoAccount {
            fn fetch_token(&self) -> std::result::Result<String, TokenError> {
                Err(TokenError::NoAccount)
            }
        }

        let downloader = VersionDownloader::user(
            reqwest::Client::new(),
            ProtocolClient::new("http://127.0.0.1:9/", crate::protocol::UrlPolicy::AnyHttp),
            Arc::new(UserAuthorization::new(Arc::new(NoAccount))),
        );
        let result = downloader
            .resolve_download_url("id", "1", &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(Error::Authentication(TokenError::NoAccount))
        ));
    }
}
