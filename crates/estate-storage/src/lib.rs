//! Bronze file storage, HTTP fetching and the page-load capability used by scrapers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod listings;

#[cfg(feature = "chrome")]
pub mod chrome;

pub use listings::{
    InsertOutcome, ListingStore, MemoryListingStore, PgListingStore, ReconciliationCandidate,
    StoredListing,
};

pub const CRATE_NAME: &str = "estate-storage";

const MAX_NAME_COLLISIONS: usize = 1000;

#[derive(Debug, Clone)]
pub struct StoredBronzeFile {
    pub path: PathBuf,
    pub records: usize,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Append-only directory of per-run JSON files named `{source}_{timestamp}.json`.
#[derive(Debug, Clone)]
pub struct BronzeStore {
    root: PathBuf,
}

impl BronzeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(source_id: &str, written_at: DateTime<Utc>, collision: usize) -> String {
        let stamp = written_at.format("%Y-%m-%d_%H%M%S");
        if collision == 0 {
            format!("{source_id}_{stamp}.json")
        } else {
            format!("{source_id}_{stamp}_{collision}.json")
        }
    }

    /// Serialize `records` as one pretty JSON array into a new, never-overwritten file.
    ///
    /// The run is staged under a hidden name and published with a hard link, which
    /// fails instead of clobbering when the target name is taken.
    pub async fn write_json<T: Serialize>(
        &self,
        source_id: &str,
        written_at: DateTime<Utc>,
        records: &[T],
    ) -> anyhow::Result<StoredBronzeFile> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating bronze directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(records).context("serializing bronze records")?;
        let staged = self.stage(source_id, &bytes).await?;
        let published = self.publish(&staged, source_id, written_at).await;
        if let Err(err) = fs::remove_file(&staged).await {
            debug!(path = %staged.display(), error = %err, "staged bronze file not removed");
        }

        Ok(StoredBronzeFile {
            path: published?,
            records: records.len(),
            content_hash: content_digest(&bytes),
            byte_size: bytes.len(),
        })
    }

    /// Hidden `.{source}-{uuid}.staging` file holding the complete run output.
    async fn stage(&self, source_id: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let staged = self
            .root
            .join(format!(".{source_id}-{}.staging", Uuid::new_v4().simple()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staged)
            .await
            .with_context(|| format!("staging bronze output at {}", staged.display()))?;
        file.write_all(bytes).await?;
        file.sync_data()
            .await
            .with_context(|| format!("syncing staged bronze output {}", staged.display()))?;
        Ok(staged)
    }

    async fn publish(
        &self,
        staged: &Path,
        source_id: &str,
        written_at: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        for collision in 0..MAX_NAME_COLLISIONS {
            let candidate = self.root.join(Self::file_name(source_id, written_at, collision));
            match fs::hard_link(staged, &candidate).await {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "publishing bronze file {} -> {}",
                            staged.display(),
                            candidate.display()
                        )
                    })
                }
            }
        }
        anyhow::bail!(
            "no free bronze file name for {source_id} at {} after {MAX_NAME_COLLISIONS} attempts",
            written_at
        )
    }

    pub async fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<Vec<T>> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading bronze file {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing bronze file {}", path.display()))
    }

    /// Every published bronze file under the root, sorted by name.
    pub async fn list_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        list_json_files(&self.root).await
    }
}

pub async fn list_json_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if !is_hidden && path.extension().map(|e| e == "json").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Hex SHA-256 of a bronze payload or a listing fingerprint.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Source identifier encoded as the bronze file name prefix.
pub fn source_from_bronze_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let (prefix, _) = name.split_once('_')?;
    (!prefix.is_empty()).then(|| prefix.to_string())
}

/// Wait before a failed queue job runs again: `first * 2^(attempt - 1)`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub first: Duration,
    pub cap: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
        }
    }
}

impl RetryBackoff {
    /// `attempt` is the 1-based attempt that just failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1);
        2u32.checked_pow(doublings)
            .and_then(|factor| self.first.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_body_bytes: Option<usize>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_body_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser error: {0}")]
    Browser(String),
}

/// Thin reqwest wrapper. Every call is bounded by the client timeout and never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: Option<usize>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// GET `url` and return the body, failing on any non-2xx status.
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async {
            let response = self.get(url).await?;
            if !response.status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: response.status.as_u16(),
                    url: response.final_url,
                });
            }
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// GET `url` and return whatever came back, including error statuses.
    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let mut body = resp.bytes().await?.to_vec();
        if let Some(limit) = self.max_body_bytes {
            body.truncate(limit);
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Options handed to a browser when a scraper run starts.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub user_agent: String,
    pub navigation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub url: String,
    pub status: u16,
    pub html: String,
}

/// One open browsing session: load a URL, get its rendered HTML.
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError>;

    async fn close(&self) {}
}

/// Page-load capability injected into scrapers.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn launch(&self, options: &BrowserOptions) -> Result<Box<dyn PageLoader>, FetchError>;
}

/// Browser backed by plain HTTP requests; no script execution.
#[derive(Debug, Clone, Default)]
pub struct HttpBrowser;

#[async_trait]
impl Browser for HttpBrowser {
    async fn launch(&self, options: &BrowserOptions) -> Result<Box<dyn PageLoader>, FetchError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: options.navigation_timeout,
            user_agent: Some(options.user_agent.clone()),
            max_body_bytes: None,
        })
        .map_err(|err| FetchError::Launch(format!("{err:#}")))?;
        Ok(Box::new(HttpPageLoader { fetcher }))
    }
}

#[derive(Debug)]
pub struct HttpPageLoader {
    fetcher: HttpFetcher,
}

#[async_trait]
impl PageLoader for HttpPageLoader {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError> {
        let response = self.fetcher.fetch_bytes("page", url).await?;
        Ok(LoadedPage {
            url: response.final_url.clone(),
            status: response.status.as_u16(),
            html: response.text(),
        })
    }
}
