//! Blob store boundary (filesystem + S3), HTTP fetch, and retry/backoff utilities.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tripload-storage";

/// Byte stream handed out by [`BlobStore::fetch`] and accepted by [`BlobStore::put`].
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object {container}/{file_id} not found")]
    NotFound { container: String, file_id: String },
    #[error("container {0} not found")]
    ContainerNotFound(String),
    #[error("invalid object id `{0}`")]
    InvalidId(String),
    #[error("transient blob store failure: {0}")]
    Transient(String),
    #[error("blob store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob store backend: {0}")]
    Backend(String),
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub file_id: String,
    pub sha256: String,
    pub byte_size: u64,
}

/// Object storage used purely as a blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list_objects(&self, container: &str) -> Result<Vec<String>, BlobError>;

    async fn fetch(&self, container: &str, file_id: &str) -> Result<BlobReader, BlobError>;

    async fn put(
        &self,
        container: &str,
        file_id: &str,
        body: BlobReader,
    ) -> Result<StoredObject, BlobError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects ids that would escape the container directory.
fn validate_object_id(file_id: &str) -> Result<(), BlobError> {
    let path = Path::new(file_id);
    let valid = !file_id.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidId(file_id.to_string()))
    }
}

/// Directory-backed blob store: `<root>/<container>/<file_id>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, container: &str, file_id: &str) -> Result<PathBuf, BlobError> {
        validate_object_id(container)?;
        validate_object_id(file_id)?;
        Ok(self.root.join(container).join(file_id))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<String>, BlobError> {
        validate_object_id(container)?;
        let base = self.root.join(container);
        if !fs::try_exists(&base).await? {
            return Err(BlobError::ContainerNotFound(container.to_string()));
        }

        let mut out = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                // In-flight puts are hidden temp files.
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let id = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(id);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn fetch(&self, container: &str, file_id: &str) -> Result<BlobReader, BlobError> {
        let path = self.object_path(container, file_id)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                container: container.to_string(),
                file_id: file_id.to_string(),
            }),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Streams into a hidden temp file while hashing, then renames into place.
    async fn put(
        &self,
        container: &str,
        file_id: &str,
        mut body: BlobReader,
    ) -> Result<StoredObject, BlobError> {
        let target = self.object_path(container, file_id)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            let mut hasher = Sha256::new();
            let mut byte_size = 0u64;
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                byte_size += n as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>((hex::encode(hasher.finalize()), byte_size))
        }
        .await;

        let (sha256, byte_size) = match written {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(BlobError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(BlobError::Io(err));
        }

        Ok(StoredObject {
            file_id: file_id.to_string(),
            sha256,
            byte_size,
        })
    }
}

/// Connection settings for an S3-compatible endpoint (AWS, MinIO, ...).
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "tripload",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .force_path_style(settings.path_style);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }
}

fn s3_error<E, R>(err: SdkError<E, R>) -> BlobError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        other => {
            let message = format!("{other:?}");
            message.contains("SlowDown")
                || message.contains("InternalError")
                || message.contains("ServiceUnavailable")
        }
    };
    let message = aws_sdk_s3::error::DisplayErrorContext(&err).to_string();
    if transient {
        BlobError::Transient(message)
    } else {
        BlobError::Backend(message)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<String>, BlobError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(container)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_bucket())
                {
                    BlobError::ContainerNotFound(container.to_string())
                } else {
                    s3_error(err)
                }
            })?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(ToString::to_string)),
            );
        }
        debug!(container, objects = keys.len(), "listed s3 objects");
        Ok(keys)
    }

    async fn fetch(&self, container: &str, file_id: &str) -> Result<BlobReader, BlobError> {
        let response = self
            .client
            .get_object()
            .bucket(container)
            .key(file_id)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    BlobError::NotFound {
                        container: container.to_string(),
                        file_id: file_id.to_string(),
                    }
                } else {
                    s3_error(err)
                }
            })?;
        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn put(
        &self,
        container: &str,
        file_id: &str,
        mut body: BlobReader,
    ) -> Result<StoredObject, BlobError> {
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes).await?;
        let sha256 = sha256_hex(&bytes);
        let byte_size = bytes.len() as u64;

        self.client
            .put_object()
            .bucket(container)
            .key(file_id)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(s3_error)?;

        Ok(StoredObject {
            file_id: file_id.to_string(),
            sha256,
            byte_size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are spent. Attempt indexes start at 0.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    what: &str,
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, ?delay, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Downloads source files over HTTP with bounded concurrency and backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.ok();
        let span = info_span!("http_fetch", url);
        let client = &self.client;

        retry_with_backoff(
            &self.backoff,
            "http_fetch",
            move |_attempt| async move {
                let resp = client.get(url).send().await?;
                let status = resp.status();
                let final_url = resp.url().to_string();
                if !status.is_success() {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                let body = resp.bytes().await?.to_vec();
                Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                })
            },
            |err: &FetchError| err.disposition() == RetryDisposition::Retryable,
        )
        .instrument(span)
        .await
    }
}

/// Object name for a downloaded URL: its last path segment, without query.
pub fn object_name_for_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn reader(bytes: &'static [u8]) -> BlobReader {
        Box::pin(std::io::Cursor::new(bytes))
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn fs_store_puts_lists_and_fetches() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        let stored = store
            .put("taxi-nyc", "2015/yellow_tripdata_2015-01.parquet", reader(b"hello world"))
            .await
            .expect("put");
        store
            .put("taxi-nyc", "yellow_tripdata_2009-01.parquet", reader(b"x"))
            .await
            .expect("put");

        assert_eq!(stored.byte_size, 11);
        assert_eq!(stored.sha256, sha256_hex(b"hello world"));
        assert_eq!(
            store.list_objects("taxi-nyc").await.expect("list"),
            vec![
                "2015/yellow_tripdata_2015-01.parquet".to_string(),
                "yellow_tripdata_2009-01.parquet".to_string(),
            ]
        );

        let mut body = store
            .fetch("taxi-nyc", "2015/yellow_tripdata_2015-01.parquet")
            .await
            .expect("fetch");
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn fs_store_reports_missing_objects_and_containers() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        assert!(matches!(
            store.list_objects("nope").await,
            Err(BlobError::ContainerNotFound(_))
        ));
        store.put("c", "a.parquet", reader(b"a")).await.expect("put");
        assert!(matches!(
            store.fetch("c", "b.parquet").await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(matches!(
            store.fetch("c", "../escape").await,
            Err(BlobError::InvalidId(_))
        ));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retry_stops_after_max_retries() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            "test",
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_permanent_errors() {
        let policy = BackoffPolicy::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            "test",
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("permanent".to_string())
            },
            |err| err != "permanent",
        )
        .await;
        assert_eq!(result, Err("permanent".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let result: Result<usize, String> = retry_with_backoff(
            &policy,
            "test",
            |attempt| async move {
                if attempt < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn object_names_come_from_the_last_url_segment() {
        assert_eq!(
            object_name_for_url("https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_2015-01.parquet?x=1"),
            Some("yellow_tripdata_2015-01.parquet".to_string())
        );
        assert_eq!(object_name_for_url("https://example.com/"), None);
    }
}
