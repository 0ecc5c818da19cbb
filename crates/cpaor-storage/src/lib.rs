//! Flat-file persistence + HTTP fetch utilities for the CPAoR pipelines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cpaor_core::DatasetsMetadata;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpaor-storage";

/// Replace `path` with `bytes` through a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Rows read from a persisted table, plus how many rows failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRead<T> {
    pub rows: Vec<T>,
    pub dropped: usize,
}

impl<T> Default for TableRead<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            dropped: 0,
        }
    }
}

/// CSV tables under a data root. Each table is owned by a single pipeline and
/// rewritten wholesale.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Read a table. A missing file is an empty table; rows that fail to
    /// deserialize are skipped and counted.
    pub async fn read<T: DeserializeOwned>(
        &self,
        relative: impl AsRef<Path>,
    ) -> anyhow::Result<TableRead<T>> {
        let path = self.path(relative);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking table {}", path.display()))?
        {
            return Ok(TableRead::default());
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading table {}", path.display()))?;
        let table = parse_csv_rows(&bytes);
        if table.dropped > 0 {
            warn!(
                table = %path.display(),
                dropped = table.dropped,
                "skipped unparseable rows"
            );
        }
        Ok(table)
    }

    pub async fn write<T: Serialize>(
        &self,
        relative: impl AsRef<Path>,
        rows: &[T],
    ) -> anyhow::Result<PathBuf> {
        let path = self.path(relative);
        let bytes = encode_csv_rows(rows).with_context(|| format!("encoding {}", path.display()))?;
        write_atomic(&path, &bytes).await?;
        debug!(table = %path.display(), rows = rows.len(), "table written");
        Ok(path)
    }
}

pub fn parse_csv_rows<T: DeserializeOwned>(bytes: &[u8]) -> TableRead<T> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let mut table = TableRead::default();
    for record in reader.deserialize::<T>() {
        match record {
            Ok(row) => table.rows.push(row),
            Err(err) => {
                debug!(error = %err, "dropping csv row");
                table.dropped += 1;
            }
        }
    }
    table
}

pub fn encode_csv_rows<T: Serialize>(rows: &[T]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error()))
}

/// Read a JSON document, returning `None` when the file is absent or empty.
pub async fn read_json_if_present<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

pub async fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// `datasets_metadata.json`, read and rewritten wholesale.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<DatasetsMetadata> {
        read_json_if_present(&self.path)
            .await?
            .with_context(|| format!("metadata file {} is missing or empty", self.path.display()))
    }

    pub async fn save(&self, metadata: &DatasetsMetadata) -> anyhow::Result<()> {
        write_json_pretty(&self.path, metadata).await
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw API responses.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        dataset: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(dataset)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        dataset: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(fetched_at, dataset, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }
        Ok(ArchivedResponse {
            content_hash,
            relative_path,
            deduplicated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
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
    #[error("invalid authorization header for {url}: {source}")]
    InvalidHeader {
        url: String,
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }
}

/// A single GET request: URL, query pairs, optional `Authorization` value
/// and a per-request timeout override.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

/// Blocking-per-call HTTP client: one request at a time, no retries. A failed
/// request surfaces to the caller, which decides whether to skip the unit.
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

    pub async fn fetch(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %request.url);
        async {
            let mut builder = self.client.get(&request.url).query(&request.query);
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(auth) = &request.authorization {
                let value =
                    HeaderValue::from_str(auth).map_err(|source| FetchError::InvalidHeader {
                        url: request.url.clone(),
                        source,
                    })?;
                let mut headers = HeaderMap::new();
                headers.insert(AUTHORIZATION, value);
                builder = builder.headers(headers);
            }
            let resp = builder.send().await.map_err(|source| FetchError::Request {
                url: request.url.clone(),
                source,
            })?;
            read_response(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, request: &HttpRequest) -> Result<T, FetchError> {
        self.fetch(request).await?.json()
    }

    /// POST an urlencoded form and decode the JSON answer.
    pub async fn post_form_json<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<T, FetchError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        read_response(resp).await?.json()
    }
}

async fn read_response(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp
        .bytes()
        .await
        .map_err(|source| FetchError::Request {
            url: final_url.clone(),
            source,
        })?
        .to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
        fetched_at: Utc::now(),
    })
}
