//! HTTP access to remote Maven-layout repositories.
//!
//! [`RemoteClient`] is the seam between the resolver and the network. The
//! production implementation, [`HttpClient`], wraps `reqwest` with the retry
//! policy below; tests substitute an in-memory client.

use std::error::Error as StdError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::{ParseError, Url};

mod coordinates;
mod metadata;

pub use coordinates::{
    ArtifactIdentity, CoordinateParseError, ExclusionPattern, SNAPSHOT_SUFFIX, SnapshotStamp,
    WILDCARD,
};
pub use metadata::{
    LOCAL_METADATA_FILE, METADATA_FILE, MavenMetadata, MetadataParseError, parse_metadata,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Retry policy for remote requests. Only 5xx responses, timeouts and
/// connection failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        let mut config = Self {
            base_delay,
            max_delay,
            max_attempts,
        };
        config.normalize();
        config
    }

    pub fn normalize(&mut self) {
        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis();
        let delay_ms = base_ms.saturating_mul(1u128 << exp);
        let capped_ms = delay_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped_ms as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5), 5)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// A file written by [`RemoteClient::download_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub len: u64,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid repository URL '{url}': {source}")]
    InvalidUrl { url: String, source: ParseError },
    #[error("failed to build URL (base: {base}, path: {path}): {source}")]
    UrlJoin {
        base: String,
        path: String,
        source: ParseError,
    },
    #[error("failed to initialise the HTTP client: {source}")]
    ClientBuild { source: reqwest::Error },
    #[error("{url} was not found (HTTP {status})")]
    NotFound { url: Url, status: StatusCode },
    #[error("HTTP {status} returned for {url}")]
    HttpStatus { url: Url, status: StatusCode },
    #[error("request to {url} failed: {source}")]
    Network { url: Url, source: reqwest::Error },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Network operations the resolver needs from a remote repository.
pub trait RemoteClient: Send + Sync {
    /// GETs `url`. A missing resource (404/410) is `Ok(None)`.
    fn fetch_bytes<'a>(&'a self, url: &'a Url)
    -> BoxFuture<'a, Result<Option<Vec<u8>>, RegistryError>>;

    /// Streams `url` into `destination`, replacing it atomically.
    fn download_to<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<DownloadedFile, RegistryError>>;
}

/// `reqwest`-backed [`RemoteClient`].
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryConfig,
}

impl HttpClient {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            // Some mirrors misbehave over HTTP/2.
            .http1_only()
            .user_agent(format!("koala-jip/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| RegistryError::ClientBuild { source })?;
        Ok(Self::with_client(client, retry))
    }

    pub fn with_client(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    async fn get_bytes(&self, url: &Url) -> Result<Option<Vec<u8>>, RegistryError> {
        match self.send(url).await? {
            Some(response) => response
                .bytes()
                .await
                .map(|bytes| Some(bytes.to_vec()))
                .map_err(|source| RegistryError::Network {
                    url: url.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn stream_to(&self, url: &Url, destination: &Path) -> Result<DownloadedFile, RegistryError> {
        let Some(mut response) = self.send(url).await? else {
            return Err(RegistryError::NotFound {
                url: url.clone(),
                status: StatusCode::NOT_FOUND,
            });
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }
        let partial = partial_path(destination);
        let written = self.write_partial(url, &mut response, &partial).await;
        let (len, sha256) = match written {
            Ok(written) => written,
            Err(error) => {
                let _ = fs::remove_file(&partial).await;
                return Err(error);
            }
        };
        fs::rename(&partial, destination)
            .await
            .map_err(|source| io_error(destination, source))?;

        Ok(DownloadedFile {
            path: destination.to_path_buf(),
            len,
            sha256,
        })
    }

    /// Streams the body into `partial`, returning its length and SHA-256.
    /// The caller removes `partial` on error.
    async fn write_partial(
        &self,
        url: &Url,
        response: &mut Response,
        partial: &Path,
    ) -> Result<(u64, String), RegistryError> {
        let mut file = fs::File::create(partial)
            .await
            .map_err(|source| io_error(partial, source))?;
        let mut hasher = Sha256::new();
        let mut len = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| RegistryError::Network {
                url: url.clone(),
                source,
            })?
        {
            hasher.update(&chunk);
            len += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|source| io_error(partial, source))?;
        }
        file.flush()
            .await
            .map_err(|source| io_error(partial, source))?;
        Ok((len, format!("{:x}", hasher.finalize())))
    }

    /// Sends a GET, retrying per [`RetryConfig`]. `Ok(None)` means 404/410.
    async fn send(&self, url: &Url) -> Result<Option<Response>, RegistryError> {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, url = %url, "sending repository request");

            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(Some(response));
                    }

                    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                        debug!(status = %status, url = %url, "resource not present");
                        return Ok(None);
                    }

                    if status.is_client_error() || attempt == max_attempts {
                        warn!(status = %status, url = %url, "request rejected");
                        return Err(RegistryError::HttpStatus {
                            url: url.clone(),
                            status,
                        });
                    }

                    warn!(
                        attempt,
                        max_attempts,
                        status = %status,
                        url = %url,
                        "HTTP {} received, retrying",
                        status
                    );
                    sleep(self.retry.delay_for_attempt(attempt)).await;
                }
                Err(error) => {
                    let retryable = error.is_timeout() || error.is_connect();
                    warn!(
                        attempt,
                        max_attempts,
                        url = %url,
                        retryable,
                        error = %error_chain(&error),
                        "HTTP request failed"
                    );
                    if retryable && attempt < max_attempts {
                        sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RegistryError::Network {
                        url: url.clone(),
                        source: error,
                    });
                }
            }
        }

        Err(RegistryError::HttpStatus {
            url: url.clone(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        })
    }
}

impl RemoteClient for HttpClient {
    fn fetch_bytes<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, RegistryError>> {
        Box::pin(self.get_bytes(url))
    }

    fn download_to<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<DownloadedFile, RegistryError>> {
        Box::pin(self.stream_to(url, destination))
    }
}

pub fn parse_base_url(raw: &str) -> Result<Url, RegistryError> {
    let mut url = Url::parse(raw).map_err(|source| RegistryError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    ensure_trailing_slash(&mut url);
    Ok(url)
}

pub fn join_path(base: &Url, relative: &str) -> Result<Url, RegistryError> {
    base.join(relative).map_err(|source| RegistryError::UrlJoin {
        base: base.to_string(),
        path: relative.to_string(),
        source,
    })
}

/// Lower-case hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub(crate) fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}

fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut chain = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        chain.push_str(&format!(" | caused by: {source}"));
        current = source.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() {
        let base = parse_base_url("https://repo1.maven.org/maven2").expect("url");
        assert_eq!(base.as_str(), "https://repo1.maven.org/maven2/");

        let joined = join_path(&base, "kr/bydelta/koalanlp-core/2.1.4/koalanlp-core-2.1.4.pom")
            .expect("join");
        assert_eq!(
            joined.as_str(),
            "https://repo1.maven.org/maven2/kr/bydelta/koalanlp-core/2.1.4/koalanlp-core-2.1.4.pom"
        );
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let retry = RetryConfig::new(Duration::from_millis(100), Duration::from_millis(350), 4);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn retry_normalizes_degenerate_values() {
        let retry = RetryConfig::new(Duration::from_secs(2), Duration::from_secs(1), 0);
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn partial_path_appends_suffix() {
        let path = Path::new("/tmp/cache/demo-1.0.jar");
        assert_eq!(partial_path(path), PathBuf::from("/tmp/cache/demo-1.0.jar.part"));
    }

    /// Answers one request with a body shorter than its Content-Length.
    fn serve_truncated_body() -> Url {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let address = listener.local_addr().expect("address");
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 2048];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\nConnection: close\r\n\r\npartial",
                );
            }
        });
        Url::parse(&format!("http://{address}/demo-1.0.jar")).expect("url")
    }

    #[tokio::test]
    async fn interrupted_download_leaves_no_partial_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let destination = temp.path().join("cache/demo-1.0.jar");
        let client = HttpClient::new(
            Duration::from_secs(5),
            RetryConfig::new(Duration::from_millis(10), Duration::from_millis(10), 1),
        )
        .expect("client");

        let result = client.stream_to(&serve_truncated_body(), &destination).await;

        assert!(matches!(result, Err(RegistryError::Network { .. })));
        assert!(!partial_path(&destination).exists());
        assert!(!destination.exists());
    }
}
