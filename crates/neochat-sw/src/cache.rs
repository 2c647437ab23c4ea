//! Cache storage capability and its in-memory implementation.
//!
//! The worker never reaches for an ambient cache global. It is handed a
//! [`CacheStorage`] and opens named buckets through it:
//!
//! ```text
//! CacheStorage
//!     └── Cache ("neochat-v2")
//!             └── RequestKey (GET url) → CacheEntry
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::request::{RequestKey, Response, ResponseSource};
use crate::ServiceWorkerError;

/// A stored request/response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: Method,

    /// Response status.
    pub status: StatusCode,

    /// Response status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response under the given request identity.
    pub fn new(key: RequestKey, response: &Response) -> Self {
        Self {
            url: key.url,
            method: key.method,
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Response {
        Response {
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            source: ResponseSource::Cache,
        }
    }
}

/// One named bucket of request/response pairs.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    /// Look up a stored response.
    async fn match_request(&self, key: &RequestKey) -> Result<Option<Response>, ServiceWorkerError>;

    /// Store a response, replacing any previous entry for the same key.
    async fn put(&self, key: RequestKey, response: &Response) -> Result<(), ServiceWorkerError>;

    /// Remove an entry.
    async fn delete(&self, key: &RequestKey) -> Result<bool, ServiceWorkerError>;

    /// All stored request identities.
    async fn keys(&self) -> Result<Vec<RequestKey>, ServiceWorkerError>;
}

/// The set of named buckets available to the worker.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Delete a bucket and everything in it.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Names of all buckets.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;
}

/// Operation counters shared by a storage and all of its buckets.
#[derive(Debug, Default)]
pub struct StorageStats {
    opens: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl StorageStats {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Total number of operations of any kind.
    pub fn total(&self) -> u64 {
        self.opens() + self.reads() + self.writes() + self.deletes()
    }
}

/// In-memory bucket.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<RequestKey, CacheEntry>>,
    stats: Arc<StorageStats>,
}

impl MemoryCache {
    fn new(name: &str, stats: Arc<StorageStats>) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            stats,
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<Response>, ServiceWorkerError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(CacheEntry::to_response))
    }

    async fn put(&self, key: RequestKey, response: &Response) -> Result<(), ServiceWorkerError> {
        if key.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {key}: only GET requests are cacheable"
            )));
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        trace!(cache = %self.name, %key, "Storing entry");
        let entry = CacheEntry::new(key.clone(), response);
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, ServiceWorkerError> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, ServiceWorkerError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
    stats: Arc<StorageStats>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation counters for this storage.
    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    /// Get an existing bucket without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.caches.read().await.get(name).cloned()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError> {
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::new(name, Arc::clone(&self.stats))));
        Ok(Arc::clone(cache) as Arc<dyn Cache>)
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.caches.read().await.keys().cloned().collect())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
