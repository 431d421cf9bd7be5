//! Bundle distribution: resolve `(pack, version)` to executable bytes.
//!
//! Sources are tried in order: inline bytes on the pack, the in-memory LRU
//! cache, then an origin fetch through the injected transport. Fetched
//! bytes land in the cache, which holds at most
//! [`pkg_constants::bundle::BUNDLE_CACHE_CAP_BYTES`] and evicts least
//! recently used entries past that. All failures surface as
//! `BUNDLE_UNAVAILABLE`; the reconciler retries with backoff.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use pkg_constants::bundle::{
    BUNDLE_CACHE_CAP_BYTES, BUNDLE_FETCH_RETRIES, BUNDLE_RETRY_BASE_DELAY_MS,
};
use pkg_metrics::{MetricsRegistry, well_known};
use pkg_types::error::Error;
use pkg_types::pack::Pack;

/// Origin access for bundle bytes. HTTP in production; tests inject stubs.
#[async_trait]
pub trait BundleTransport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BundleTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::NotConnected(format!("origin {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::NotConnected(format!(
                "origin {url} answered {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::NotConnected(format!("origin {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Byte-budgeted LRU over `(pack id, version)`.
struct ByteLru {
    entries: LruCache<(Uuid, String), Arc<Vec<u8>>>,
    bytes: usize,
}

impl ByteLru {
    fn new() -> Self {
        Self {
            // The count bound is a formality; the byte budget is what evicts.
            entries: LruCache::new(NonZeroUsize::new(1 << 20).unwrap()),
            bytes: 0,
        }
    }

    fn get(&mut self, key: &(Uuid, String)) -> Option<Arc<Vec<u8>>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: (Uuid, String), value: Arc<Vec<u8>>) {
        if value.len() > BUNDLE_CACHE_CAP_BYTES {
            return;
        }
        if let Some(old) = self.entries.put(key, value.clone()) {
            self.bytes -= old.len();
        }
        self.bytes += value.len();
        while self.bytes > BUNDLE_CACHE_CAP_BYTES {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.len(),
                None => break,
            }
        }
    }
}

pub struct BundleResolver {
    cache: Mutex<ByteLru>,
    transport: Arc<dyn BundleTransport>,
    metrics: Arc<MetricsRegistry>,
}

impl BundleResolver {
    pub fn new(transport: Arc<dyn BundleTransport>, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(ByteLru::new()),
            transport,
            metrics,
        })
    }

    /// Resolve the executable bytes for a pack.
    pub async fn resolve(&self, pack: &Pack) -> Result<Arc<Vec<u8>>, Error> {
        if let Some(inline) = &pack.bundle_bytes {
            return Ok(Arc::new(inline.clone()));
        }

        let key = (pack.id, pack.version.clone());
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            self.metrics.counter_inc(well_known::BUNDLE_CACHE_HITS);
            return Ok(cached);
        }
        self.metrics.counter_inc(well_known::BUNDLE_CACHE_MISSES);

        let url = pack.bundle_url.as_deref().ok_or_else(|| Error::BundleUnavailable {
            name: pack.name.clone(),
            version: pack.version.clone(),
            detail: "pack has neither inline bytes nor an origin locator".into(),
        })?;

        let mut last_error = String::new();
        for attempt in 0..BUNDLE_FETCH_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(BUNDLE_RETRY_BASE_DELAY_MS << (attempt - 1));
                tokio::time::sleep(delay).await;
            }
            match self.transport.fetch(url).await {
                Ok(bytes) => {
                    debug!(pack = %pack.name, version = %pack.version, size = bytes.len(), "bundle fetched");
                    let bytes = Arc::new(bytes);
                    self.cache.lock().unwrap().insert(key, bytes.clone());
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!(pack = %pack.name, attempt, error = %e, "bundle fetch failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(Error::BundleUnavailable {
            name: pack.name.clone(),
            version: pack.version.clone(),
            detail: last_error,
        })
    }

    /// Bytes currently pinned in the cache.
    pub fn cached_bytes(&self) -> usize {
        self.cache.lock().unwrap().bytes
    }
}
