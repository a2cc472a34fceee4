//! Cache API: named buckets of stored GET responses.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bellari_net::{Network, Request, Response};
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Cache storage shared by every worker version of an origin.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// Entry key. Only GET responses are stored, so the URL without its
/// fragment identifies the request.
fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Repeated names keep every value.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: cache_key(&request.url),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("stored url {}: {e}", self.url)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("stored status: {e}")))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(format!("stored header {name}: {e}")))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| ServiceWorkerError::CacheError(format!("stored header {name}: {e}")))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone().into(),
        })
    }
}

// ==================== Cache ====================

/// A cache bucket.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Non-GET requests never match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.match_url(&request.url)
    }

    /// Match a GET request for `url`.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(url))
    }

    /// Store a response for a GET request.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<()> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot store {} {}",
                request.method, request.url
            )));
        }
        let entry = CacheEntry::from_response(request, response);
        trace!(cache = %self.name, url = %entry.url, status = entry.status, "Cache put");
        self.entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Store a batch of responses, all or nothing.
    ///
    /// Every response must be 2xx and every request a GET.
    pub fn put_all(&mut self, pairs: &[(Request, Response)]) -> Result<()> {
        for (request, response) in pairs {
            if request.method != Method::GET {
                return Err(ServiceWorkerError::CacheError(format!(
                    "cannot store {} {}",
                    request.method, request.url
                )));
            }
            if !response.ok() {
                return Err(ServiceWorkerError::BadStatus {
                    url: request.url.to_string(),
                    status: response.status.as_u16(),
                });
            }
        }
        for (request, response) in pairs {
            self.put(request, response)?;
        }
        Ok(())
    }

    /// Delete the entry for `url`.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(url)).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Stored entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Durable side of cache storage.
///
/// Asked before a bucket is dropped from memory. If it refuses, the bucket
/// stays.
pub trait CacheBackend: Send + Sync + fmt::Debug {
    fn remove(&self, name: &str) -> Result<()>;
}

/// Cache storage (caches global).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    /// Names in creation order.
    order: Vec<String>,
    #[serde(skip)]
    backend: Option<Arc<dyn CacheBackend>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route bucket deletions through `backend`.
    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Wrap for sharing between the container and its workers.
    pub fn shared(self) -> SharedCacheStorage {
        Arc::new(RwLock::new(self))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            debug!(cache = %name, "Creating cache");
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Delete a cache. Returns `Ok(false)` if there was none.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        if !self.caches.contains_key(name) {
            return Ok(false);
        }
        if let Some(backend) = &self.backend {
            backend.remove(name)?;
        }
        self.order.retain(|n| n != name);
        self.caches.remove(name);
        Ok(true)
    }

    /// All cache names, oldest first.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all caches, oldest first.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(request))
    }
}

/// `cache.addAll()`: fetch every request, then store them only if all
/// succeeded with a 2xx status.
///
/// The bucket is created even when the batch fails.
pub async fn add_all(
    caches: &RwLock<CacheStorage>,
    cache_name: &str,
    network: &dyn Network,
    requests: Vec<Request>,
) -> Result<usize> {
    caches.write().await.open(cache_name);

    let pairs = try_join_all(requests.into_iter().map(|request| async move {
        match network.fetch(&request).await {
            Ok(response) if response.ok() => Ok((request, response)),
            Ok(response) => Err(ServiceWorkerError::BadStatus {
                url: request.url.to_string(),
                status: response.status.as_u16(),
            }),
            Err(source) => Err(ServiceWorkerError::FetchFailed {
                url: request.url.to_string(),
                source,
            }),
        }
    }))
    .await?;

    let mut storage = caches.write().await;
    storage.open(cache_name).put_all(&pairs)?;
    Ok(pairs.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://bellari.example").unwrap().join(path).unwrap()
    }

    fn ok_response(path: &str, body: &'static [u8]) -> Response {
        Response::new(url(path), StatusCode::OK, body)
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("v1");
        let request = Request::get(url("/static/app.css"));

        cache.put(&request, &ok_response("/static/app.css", b"body{}")).unwrap();

        let entry = cache.match_request(&request).unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, b"body{}");
        assert!(cache.match_url(&url("/static/other.css")).is_none());
    }

    #[test]
    fn test_fragment_is_ignored() {
        let mut cache = Cache::new("v1");
        cache
            .put(&Request::get(url("/")), &ok_response("/", b"<html>"))
            .unwrap();

        assert!(cache.match_url(&url("/#contact")).is_some());
    }

    #[test]
    fn test_non_get_never_stored_or_matched() {
        let mut cache = Cache::new("v1");
        let post = Request::post(url("/"), "x".into());
        assert!(cache.put(&post, &ok_response("/", b"")).is_err());

        cache
            .put(&Request::get(url("/")), &ok_response("/", b""))
            .unwrap();
        assert!(cache.match_request(&post).is_none());
    }

    #[test]
    fn test_put_all_is_atomic() {
        let mut cache = Cache::new("v1");
        let pairs = vec![
            (Request::get(url("/")), ok_response("/", b"<html>")),
            (
                Request::get(url("/static/logo.png")),
                Response::new(url("/static/logo.png"), StatusCode::NOT_FOUND, &b""[..]),
            ),
        ];

        let err = cache.put_all(&pairs).unwrap_err();
        assert!(matches!(err, ServiceWorkerError::BadStatus { status: 404, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_round_trips_headers() {
        let mut response = ok_response("/static/logo.png", b"PNG");
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("image/png"),
        );
        let mut cache = Cache::new("v1");
        cache
            .put(&Request::get(url("/static/logo.png")), &response)
            .unwrap();

        let rebuilt = cache
            .match_url(&url("/static/logo.png"))
            .unwrap()
            .to_response()
            .unwrap();
        assert_eq!(rebuilt.header("content-type"), Some("image/png"));
        assert_eq!(rebuilt.status, StatusCode::OK);
    }

    #[test]
    fn test_repeated_and_opaque_headers_survive() {
        let disposition = HeaderValue::from_bytes(b"attachment; filename=\"logo-\xe9.png\"").unwrap();
        let mut response = ok_response("/static/logo.png", b"PNG");
        response
            .headers
            .append(http::header::VARY, HeaderValue::from_static("accept-encoding"));
        response
            .headers
            .append(http::header::VARY, HeaderValue::from_static("origin"));
        response
            .headers
            .append(http::header::CONTENT_DISPOSITION, disposition.clone());

        let mut cache = Cache::new("v1");
        cache
            .put(&Request::get(url("/static/logo.png")), &response)
            .unwrap();
        let rebuilt = cache
            .match_url(&url("/static/logo.png"))
            .unwrap()
            .to_response()
            .unwrap();

        let vary: Vec<_> = rebuilt.headers.get_all(http::header::VARY).iter().collect();
        assert_eq!(vary, vec!["accept-encoding", "origin"]);
        assert_eq!(
            rebuilt.headers.get(http::header::CONTENT_DISPOSITION),
            Some(&disposition)
        );
        assert_eq!(rebuilt.headers, response.headers);
    }

    #[test]
    fn test_corrupt_stored_header_is_an_error() {
        let mut cache = Cache::new("v1");
        cache
            .put(&Request::get(url("/")), &ok_response("/", b"<html>"))
            .unwrap();
        let mut entry = cache.match_url(&url("/")).unwrap().clone();
        entry.headers.push(("bad name".into(), b"x".to_vec()));

        assert!(matches!(
            entry.to_response(),
            Err(ServiceWorkerError::CacheError(_))
        ));
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        cache
            .put(&Request::get(url("/a.js")), &ok_response("/a.js", b""))
            .unwrap();
        assert!(cache.delete(&url("/a.js")));
        assert!(!cache.delete(&url("/a.js")));
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_cache_storage_order() {
        let mut storage = CacheStorage::new();

        assert!(!storage.has("bellari-pwa-v1"));
        storage.open("bellari-pwa-v0");
        storage.open("bellari-pwa-v1");
        storage.open("bellari-pwa-v0");

        assert_eq!(storage.keys(), vec!["bellari-pwa-v0", "bellari-pwa-v1"]);

        assert!(storage.delete("bellari-pwa-v0").unwrap());
        assert!(!storage.delete("bellari-pwa-v0").unwrap());
        assert_eq!(storage.keys(), vec!["bellari-pwa-v1"]);
    }

    #[derive(Debug)]
    struct ReadOnlyBackend;

    impl CacheBackend for ReadOnlyBackend {
        fn remove(&self, name: &str) -> Result<()> {
            Err(ServiceWorkerError::CacheError(format!("{name}: read-only")))
        }
    }

    #[test]
    fn test_refused_delete_keeps_bucket() {
        let mut storage = CacheStorage::new().with_backend(Arc::new(ReadOnlyBackend));
        storage.open("bellari-pwa-v0");

        assert!(matches!(
            storage.delete("bellari-pwa-v0"),
            Err(ServiceWorkerError::CacheError(_))
        ));
        assert!(storage.has("bellari-pwa-v0"));
        assert_eq!(storage.keys(), vec!["bellari-pwa-v0"]);

        // Nothing to delete, so the backend is not asked.
        assert!(!storage.delete("missing").unwrap());
    }

    #[test]
    fn test_storage_match_prefers_oldest() {
        let mut storage = CacheStorage::new();
        let request = Request::get(url("/"));
        storage
            .open("old")
            .put(&request, &ok_response("/", b"old"))
            .unwrap();
        storage
            .open("new")
            .put(&request, &ok_response("/", b"new"))
            .unwrap();

        assert_eq!(storage.match_request(&request).unwrap().body, b"old");
    }

    #[test]
    fn test_storage_snapshot() {
        let mut storage = CacheStorage::new();
        storage
            .open("bellari-pwa-v1")
            .put(&Request::get(url("/")), &ok_response("/", b"<html>"))
            .unwrap();

        let json = serde_json::to_string(&storage).unwrap();
        let restored: CacheStorage = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.keys(), vec!["bellari-pwa-v1"]);
        assert!(restored
            .get("bellari-pwa-v1")
            .and_then(|c| c.match_url(&url("/")))
            .is_some());
    }
}
