//! Asset fetchers for the prefetcher

use crate::client::prefetch::{AssetFetcher, FetchError};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Reads `file://` urls, plain paths and `asset://` urls below a root directory
pub struct FileSystemFetcher {
    root: PathBuf,
}

impl FileSystemFetcher {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some(relative) = url.strip_prefix("asset://") {
            return Ok(self.root.join(relative));
        }
        if url.contains("://") {
            return Err(FetchError::Unsupported { url: url.to_string() });
        }
        let path = Path::new(url);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }
}

#[async_trait]
impl AssetFetcher for FileSystemFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.resolve(url)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::not_found(url),
            _ => FetchError::transient(url, e.to_string()),
        })
    }
}

/// Downloads `http://` and `https://` assets
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("storyweave/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

/// Map an asset server's answer onto the retry policy
pub fn classify_status(url: &str, status: StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(FetchError::transient(url, format!("server answered {status}")));
    }
    Err(FetchError::Rejected {
        url: url.to_string(),
        status: status.as_u16(),
    })
}

fn request_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        return FetchError::Unsupported { url: url.to_string() };
    }
    if error.is_timeout() {
        return FetchError::transient(url, "request timed out");
    }
    FetchError::transient(url, error.to_string())
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        classify_status(url, response.status())?;
        let body = response.bytes().await.map_err(|e| request_error(url, e))?;
        debug!("Downloaded '{url}' ({} bytes)", body.len());
        Ok(body.to_vec())
    }
}

/// Sends web urls to one fetcher and everything else to another
pub struct RoutingFetcher {
    local: Arc<dyn AssetFetcher>,
    remote: Arc<dyn AssetFetcher>,
}

impl RoutingFetcher {
    pub fn new(local: Arc<dyn AssetFetcher>, remote: Arc<dyn AssetFetcher>) -> Self {
        Self { local, remote }
    }

    fn is_remote(url: &str) -> bool {
        let scheme = url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());
        matches!(scheme.as_deref(), Some("http" | "https"))
    }
}

#[async_trait]
impl AssetFetcher for RoutingFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if Self::is_remote(url) {
            self.remote.fetch(url).await
        } else {
            self.local.fetch(url).await
        }
    }
}

/// Fetcher serving assets from memory, with injectable failures and latency
#[derive(Default)]
pub struct InMemoryFetcher {
    assets: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, url: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.assets.insert(url.into(), bytes);
        self
    }

    /// Fail the next `times` fetches of `url` with a transient error
    pub fn failing(mut self, url: impl Into<String>, times: u32) -> Self {
        self.failures.get_mut().insert(url.into(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn lookup(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(url)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(FetchError::transient(url, "injected failure"));
            }
        }
        self.assets
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::not_found(url))
    }
}

#[async_trait]
impl AssetFetcher for InMemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let result = self.lookup(url).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_system_fetcher_resolves_urls() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bg")).unwrap();
        std::fs::write(dir.path().join("bg/rain.png"), b"png").unwrap();
        let fetcher = FileSystemFetcher::new(dir.path());

        assert_eq!(fetcher.fetch("asset://bg/rain.png").await.unwrap(), b"png");
        assert_eq!(fetcher.fetch("bg/rain.png").await.unwrap(), b"png");
        let absolute = format!("file://{}", dir.path().join("bg/rain.png").display());
        assert_eq!(fetcher.fetch(&absolute).await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn file_system_fetcher_classifies_failures() {
        let dir = TempDir::new().unwrap();
        let fetcher = FileSystemFetcher::new(dir.path());

        assert!(matches!(
            fetcher.fetch("asset://nope.png").await,
            Err(FetchError::NotFound { .. })
        ));
        let err = fetcher.fetch("https://cdn.example/bg.png").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn asset_server_answers_are_classified() {
        let url = "https://cdn.example/bg.png";
        assert!(classify_status(url, StatusCode::OK).is_ok());

        for status in [StatusCode::NOT_FOUND, StatusCode::GONE, StatusCode::FORBIDDEN] {
            let err = classify_status(url, status).unwrap_err();
            assert!(!err.is_retryable(), "{status} should be final");
        }
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let err = classify_status(url, status).unwrap_err();
            assert!(err.is_retryable(), "{status} should be retried");
        }
    }

    #[tokio::test]
    async fn web_urls_go_to_the_remote_fetcher() {
        let local = Arc::new(InMemoryFetcher::new().with_asset("asset://bg.png", b"local".to_vec()));
        let remote = Arc::new(InMemoryFetcher::new().with_asset("HTTPS://cdn.example/a.ogg", b"remote".to_vec()));
        let router = RoutingFetcher::new(local.clone(), remote.clone());

        assert_eq!(router.fetch("asset://bg.png").await.unwrap(), b"local");
        assert_eq!(router.fetch("HTTPS://cdn.example/a.ogg").await.unwrap(), b"remote");
        assert!(router.fetch("http://cdn.example/missing.ogg").await.is_err());
        assert_eq!((local.calls(), remote.calls()), (1, 2));
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let fetcher = InMemoryFetcher::new()
            .with_asset("asset://a", vec![1])
            .failing("asset://a", 1);
        assert!(fetcher.fetch("asset://a").await.is_err());
        assert_eq!(fetcher.fetch("asset://a").await.unwrap(), vec![1]);
        assert_eq!(fetcher.calls(), 2);
    }
}
