//! Resource prefetcher - Bounded, de-duplicated asset downloads
//!
//! Every URL is fetched at most once per prefetcher: the first request starts a
//! shared download task and later requests join it, or read its result once it
//! has finished. Downloads are detached tasks, so dropping interest in a branch
//! never cancels them. A URL that keeps failing resolves to
//! [`AssetStatus::Unavailable`] and playback carries on without it.

use crate::config::PrefetchConfig;
use crate::domain::entities::Event;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

/// Errors returned by asset fetchers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Asset not found: {url}")]
    NotFound { url: String },

    #[error("Unsupported asset url: {url}")]
    Unsupported { url: String },

    /// The asset server refused the request for good
    #[error("Asset server answered {status} for {url}")]
    Rejected { url: String, status: u16 },

    #[error("Fetching '{url}' failed: {reason}")]
    Transient { url: String, reason: String },
}

impl FetchError {
    pub fn not_found(url: impl Into<String>) -> Self {
        Self::NotFound { url: url.into() }
    }

    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Missing local assets may still be uploading, so only bad urls and
    /// refusals from an asset server are final
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Unsupported { .. } | FetchError::Rejected { .. })
    }
}

/// Source of asset bytes
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Outcome of a prefetch
#[derive(Debug, Clone, PartialEq)]
pub enum AssetStatus {
    Ready(Arc<[u8]>),
    /// Retries exhausted; render without the asset
    Unavailable,
}

impl AssetStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, AssetStatus::Ready(_))
    }
}

type AssetFuture = Shared<BoxFuture<'static, AssetStatus>>;

pub struct ResourcePrefetcher {
    fetcher: Arc<dyn AssetFetcher>,
    permits: Arc<Semaphore>,
    config: PrefetchConfig,
    assets: Mutex<HashMap<String, AssetFuture>>,
}

impl ResourcePrefetcher {
    pub fn new(fetcher: Arc<dyn AssetFetcher>, config: PrefetchConfig) -> Self {
        debug!("Prefetcher initialized (concurrency={})", config.concurrency);
        Self {
            fetcher,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            assets: Mutex::new(HashMap::new()),
        }
    }

    /// Start downloading `url` in the background unless it is already known
    pub fn prefetch(&self, url: &str) {
        let (download, created) = self.entry(url);
        if created {
            tokio::spawn(async move {
                download.await;
            });
        }
    }

    /// Prefetch every asset an event references; returns how many it names
    pub fn prefetch_event(&self, event: &Event) -> usize {
        let refs = event.resource_refs();
        for resource in &refs {
            self.prefetch(&resource.url);
        }
        refs.len()
    }

    /// Wait for `url`, starting the download if nobody asked for it yet
    pub async fn get(&self, url: &str) -> AssetStatus {
        let (download, _) = self.entry(url);
        download.await
    }

    /// Result of a finished download, `None` while unknown or in flight
    pub fn status(&self, url: &str) -> Option<AssetStatus> {
        self.lock().get(url).and_then(|download| download.peek().cloned())
    }

    /// Number of URLs seen so far
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AssetFuture>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, url: &str) -> (AssetFuture, bool) {
        let mut assets = self.lock();
        if let Some(existing) = assets.get(url) {
            return (existing.clone(), false);
        }
        let download = download(
            self.fetcher.clone(),
            self.permits.clone(),
            self.config.clone(),
            url.to_string(),
        )
        .boxed()
        .shared();
        assets.insert(url.to_string(), download.clone());
        (download, true)
    }
}

async fn download(
    fetcher: Arc<dyn AssetFetcher>,
    permits: Arc<Semaphore>,
    config: PrefetchConfig,
    url: String,
) -> AssetStatus {
    for attempt in 1..=config.max_attempts {
        let result = {
            let Ok(_permit) = permits.acquire().await else {
                return AssetStatus::Unavailable;
            };
            fetcher.fetch(&url).await
        };
        match result {
            Ok(bytes) => {
                debug!("Fetched '{url}' ({} bytes)", bytes.len());
                return AssetStatus::Ready(bytes.into());
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                warn!("Attempt {attempt} for '{url}' failed, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("Giving up on '{url}' after {attempt} attempt(s): {e}");
                return AssetStatus::Unavailable;
            }
        }
    }
    AssetStatus::Unavailable
}
