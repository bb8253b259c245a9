//! Weight artifact fetcher.
//!
//! Streams a remote file to disk with progress reporting. A destination
//! that already exists short-circuits without touching the network. Bytes
//! land in a `.part` sibling first and are renamed into place only after
//! the stream completes, so a failed transfer never leaves a truncated
//! artifact at the destination path.

use crate::config::FetchConfig;
use crate::error::FetchError;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Size of the buffered writer between the response stream and the file.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The destination already existed; no request was made.
    AlreadyPresent,
    /// The artifact was downloaded.
    Downloaded { bytes: u64 },
}

/// Receives progress updates while a download is running.
pub trait ProgressReporter: Send {
    /// Called after every chunk written. `total` is the advertised
    /// Content-Length, when the server sent one.
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>);
}

/// Discards progress updates.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_progress(&mut self, _downloaded: u64, _total: Option<u64>) {}
}

/// Logs progress through `tracing` in 10% steps.
#[derive(Debug, Default)]
pub struct LogProgress {
    last_decile: u64,
}

impl ProgressReporter for LogProgress {
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>) {
        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };
        let decile = (downloaded.saturating_mul(10) / total).min(10);
        if decile > self.last_decile {
            self.last_decile = decile;
            info!(downloaded, total, "Download {}% complete", decile * 10);
        }
    }
}

/// Percentage complete, or `None` when the total size is unknown.
pub fn percent_complete(downloaded: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(t) if t > 0 => Some((downloaded as f64 / t as f64) * 100.0),
        _ => None,
    }
}

/// Downloads weight artifacts over HTTP(S).
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
}

impl ArtifactFetcher {
    /// Create a fetcher with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("deepfly/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Create a fetcher from the `[fetch]` configuration section.
    pub fn from_config(config: &FetchConfig) -> Result<Self, FetchError> {
        Self::new(Duration::from_secs(config.connect_timeout_secs))
    }

    /// Download `url` to `destination`, unless it already exists.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn ProgressReporter,
    ) -> Result<FetchOutcome, FetchError> {
        if destination.exists() {
            info!(path = %destination.display(), "Artifact already exists, skipping download");
            return Ok(FetchOutcome::AlreadyPresent);
        }

        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        match total {
            Some(t) => info!(url, bytes = t, "Downloading artifact"),
            None => warn!(url, "Content-Length header is missing, progress is unavailable"),
        }

        let part_path = part_path(destination);
        match stream_to_file(response, url, &part_path, total, progress).await {
            Ok(bytes) => {
                tokio::fs::rename(&part_path, destination)
                    .await
                    .map_err(|e| FetchError::io(destination, e))?;
                info!(path = %destination.display(), bytes, "Download complete");
                Ok(FetchOutcome::Downloaded { bytes })
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part_path).await {
                    debug!(path = %part_path.display(), error = %rm, "No partial file to clean up");
                }
                Err(e)
            }
        }
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    path: &Path,
    total: Option<u64>,
    progress: &mut dyn ProgressReporter,
) -> Result<u64, FetchError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Network {
            url: url.to_string(),
            message: format!("failed to read response body: {e}"),
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(path, e))?;
        downloaded += chunk.len() as u64;
        progress.on_progress(downloaded, total);
    }

    writer.flush().await.map_err(|e| FetchError::io(path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| FetchError::io(path, e))?;
    Ok(downloaded)
}

/// `<destination>.part`, next to the destination.
fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
