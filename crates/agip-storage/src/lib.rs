//! Snapshot fetching, content fingerprints and warehouse backends for AGIP.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;
mod warehouse;

pub use memory::{MemoryState, MemoryTx, MemoryWarehouse, RawTableContent};
pub use postgres::{PgTx, PgWarehouse};
pub use warehouse::{AuditTables, RawLoad, Warehouse, WarehouseError, WarehouseTx};

const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Local landing area for downloaded snapshots, one directory per dataset.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn destination_for(&self, dataset: &str, file_name: &str) -> PathBuf {
        self.root.join(dataset).join(file_name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Streams a file through SHA-256. Returns the hex digest and byte size.
    pub async fn fingerprint_file(path: &Path) -> anyhow::Result<(String, u64)> {
        let mut file = fs::File::open(path)
            .await
            .with_context(|| format!("opening snapshot {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK_BYTES];
        let mut total = 0u64;
        loop {
            let read = file
                .read(&mut buf)
                .await
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            total += read as u64;
        }
        Ok((hex::encode(hasher.finalize()), total))
    }
}

/// Writes through a temp file and renames over `destination`, so a reader
/// never sees a half-written snapshot.
pub async fn write_atomically(destination: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, destination).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unsupported source locator `{0}`")]
    UnsupportedLocator(String),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Retrieves one snapshot to `destination`. No retries: a failure aborts the
/// invocation and the next scheduled run is the retry.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let span = info_span!("http_fetch", url, destination = %destination.display());
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            write_atomically(destination, &body)
                .await
                .map_err(|source| FetchError::Io {
                    action: "writing",
                    path: destination.to_path_buf(),
                    source,
                })?;
            debug!(bytes = body.len(), "snapshot written");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

/// Copies `file://` locators and bare paths; used for mirrored or manually
/// dropped snapshots.
#[derive(Debug, Clone, Default)]
pub struct LocalFileFetcher;

impl LocalFileFetcher {
    fn source_path(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

#[async_trait]
impl SourceFetcher for LocalFileFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let source = Self::source_path(url);
        let bytes = fs::read(&source).await.map_err(|err| FetchError::Io {
            action: "reading",
            path: source.clone(),
            source: err,
        })?;
        write_atomically(destination, &bytes)
            .await
            .map_err(|source| FetchError::Io {
                action: "writing",
                path: destination.to_path_buf(),
                source,
            })
    }
}

/// Dispatches on the locator scheme.
#[derive(Debug, Clone)]
pub struct SchemeFetcher {
    http: HttpFetcher,
    local: LocalFileFetcher,
}

impl SchemeFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            local: LocalFileFetcher,
        })
    }
}

#[async_trait]
impl SourceFetcher for SchemeFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        if url.starts_with("https://") || url.starts_with("http://") {
            self.http.fetch(url, destination).await
        } else if url.starts_with("file://") || !url.contains("://") {
            self.local.fetch(url, destination).await
        } else {
            Err(FetchError::UnsupportedLocator(url.to_string()))
        }
    }
}
