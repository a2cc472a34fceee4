//! The offline cache worker: install, activate and fetch handlers.

use std::fmt;
use std::sync::Arc;

use bellari_net::{Network, Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{self, SharedCacheStorage};
use crate::config::WorkerConfig;
use crate::policy::{InterceptPolicy, PassthroughReason, Strategy};
use crate::{Result, ServiceWorkerError};

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The cached offline fallback, served in place of the requested page.
    OfflineFallback,
}

/// Result of dispatching a fetch event.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The worker did not call `respondWith`.
    Passthrough(PassthroughReason),
    /// The worker supplied a response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchOutcome {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough(_))
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Respond { source, .. } => Some(*source),
            FetchOutcome::Passthrough(_) => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond { response, .. } => Some(response),
            FetchOutcome::Passthrough(_) => None,
        }
    }
}

/// One version of the offline worker.
///
/// Handlers only complete once every cache and network operation they
/// started has resolved.
pub struct OfflineCacheWorker {
    config: WorkerConfig,
    policy: InterceptPolicy,
    fallback_url: Url,
    caches: SharedCacheStorage,
    network: Arc<dyn Network>,
}

impl fmt::Debug for OfflineCacheWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineCacheWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineCacheWorker {
    pub fn new(
        config: WorkerConfig,
        caches: SharedCacheStorage,
        network: Arc<dyn Network>,
    ) -> Result<Self> {
        config.validate()?;
        let fallback_url = config.fallback_url()?;
        Ok(Self {
            policy: InterceptPolicy::new(&config.origin),
            fallback_url,
            config,
            caches,
            network,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub fn policy(&self) -> &InterceptPolicy {
        &self.policy
    }

    /// Install handler: seed the current bucket.
    ///
    /// Any failed or non-2xx seed fetch fails the whole install and stores
    /// nothing.
    pub async fn install(&self) -> Result<usize> {
        let requests: Vec<Request> = self
            .config
            .seed_urls()?
            .into_iter()
            .map(Request::get)
            .collect();

        info!(cache = %self.cache_name(), seeds = requests.len(), "Opened cache");

        let stored = cache::add_all(&self.caches, self.cache_name(), self.network.as_ref(), requests)
            .await
            .map_err(|e| {
                warn!(cache = %self.cache_name(), error = %e, "Seeding failed");
                ServiceWorkerError::InstallFailed {
                    cache: self.cache_name().to_string(),
                    source: Box::new(e),
                }
            })?;

        info!(cache = %self.cache_name(), stored, "App shell cached");
        Ok(stored)
    }

    /// Activate handler, cache half: delete every bucket but the current
    /// one. Returns the deleted names. Running it again is a no-op.
    ///
    /// Stops at the first bucket storage refuses to delete; that bucket and
    /// any after it stay until the next attempt.
    pub async fn purge_stale_caches(&self) -> Result<Vec<String>> {
        let mut storage = self.caches.write().await;
        let stale: Vec<String> = storage
            .keys()
            .into_iter()
            .filter(|name| *name != self.cache_name())
            .map(str::to_string)
            .collect();

        for name in &stale {
            info!(cache = %name, "Clearing old cache");
            storage.delete(name).map_err(|e| {
                warn!(cache = %name, error = %e, "Could not delete old cache");
                e
            })?;
        }
        Ok(stale)
    }

    /// Fetch handler.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
        let strategy = self.policy.strategy(request);
        debug!(url = %request.url, method = %request.method, ?strategy, "Fetch event");

        match strategy {
            Strategy::Passthrough(reason) => Ok(FetchOutcome::Passthrough(reason)),
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn network_first(&self, request: &Request) -> Result<FetchOutcome> {
        let err = match self.network.fetch(request).await {
            Ok(response) => {
                return Ok(FetchOutcome::Respond {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(err) => err,
        };

        debug!(url = %request.url, error = %err, "Navigation offline, trying cache");

        if let Some(response) = self.cached(request).await? {
            return Ok(FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            });
        }

        let fallback = Request::get(self.fallback_url.clone());
        match self.cached(&fallback).await? {
            Some(response) => Ok(FetchOutcome::Respond {
                response,
                source: ResponseSource::OfflineFallback,
            }),
            None => {
                warn!(url = %request.url, "Offline and no app shell cached");
                Err(ServiceWorkerError::FetchFailed {
                    url: request.url.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<FetchOutcome> {
        if let Some(response) = self.cached(request).await? {
            return Ok(FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            });
        }

        // Not written back: the bucket only ever holds the seed list.
        let response = self
            .network
            .fetch(request)
            .await
            .map_err(|source| ServiceWorkerError::FetchFailed {
                url: request.url.to_string(),
                source,
            })?;

        Ok(FetchOutcome::Respond {
            response,
            source: ResponseSource::Network,
        })
    }

    /// `caches.match()` across every bucket, oldest first, as the site's
    /// worker does. Stale and empty buckets are searched too until activation
    /// purges them. Not scoped to the current bucket.
    async fn cached(&self, request: &Request) -> Result<Option<Response>> {
        let storage = self.caches.read().await;
        storage
            .match_request(request)
            .map(|entry| entry.to_response())
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheStorage};
    use async_trait::async_trait;
    use bellari_net::NetError;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves `<path>` as the body of every same-origin URL, or fails.
    struct EchoNetwork {
        online: bool,
        calls: AtomicUsize,
    }

    impl EchoNetwork {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Network for EchoNetwork {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.online {
                return Err(NetError::Offline("test".into()));
            }
            Ok(Response::new(
                request.url.clone(),
                StatusCode::OK,
                request.url.path().to_string(),
            ))
        }
    }

    fn origin() -> Url {
        Url::parse("https://bellari.example").unwrap()
    }

    fn worker(network: Arc<EchoNetwork>) -> OfflineCacheWorker {
        OfflineCacheWorker::new(
            WorkerConfig::new(origin()),
            CacheStorage::new().shared(),
            network,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_install_seeds_bucket() {
        let worker = worker(EchoNetwork::new(true));
        assert_eq!(worker.install().await.unwrap(), 2);

        let storage = worker.caches.read().await;
        let cache = storage.get("bellari-pwa-v1").unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_install_offline_fails() {
        let worker = worker(EchoNetwork::new(false));
        let err = worker.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));
        assert!(worker.caches.read().await.get("bellari-pwa-v1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_current_only() {
        let worker = worker(EchoNetwork::new(true));
        {
            let mut storage = worker.caches.write().await;
            storage.open("bellari-pwa-v0");
            storage.open("bellari-pwa-v1");
            storage.open("scratch");
        }

        let deleted = worker.purge_stale_caches().await.unwrap();
        assert_eq!(deleted, vec!["bellari-pwa-v0", "scratch"]);
        assert_eq!(worker.caches.read().await.keys(), vec!["bellari-pwa-v1"]);

        assert!(worker.purge_stale_caches().await.unwrap().is_empty());
    }

    #[derive(Debug)]
    struct LockedBackend;

    impl CacheBackend for LockedBackend {
        fn remove(&self, name: &str) -> Result<()> {
            Err(ServiceWorkerError::CacheError(format!("{name} is locked")))
        }
    }

    #[tokio::test]
    async fn test_refused_purge_keeps_stale_bucket() {
        let mut storage = CacheStorage::new().with_backend(Arc::new(LockedBackend));
        storage.open("bellari-pwa-v0");
        let worker = OfflineCacheWorker::new(
            WorkerConfig::new(origin()),
            storage.shared(),
            EchoNetwork::new(true),
        )
        .unwrap();

        let err = worker.purge_stale_caches().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::CacheError(_)));
        assert_eq!(worker.caches.read().await.keys(), vec!["bellari-pwa-v0"]);
    }

    #[tokio::test]
    async fn test_cached_asset_skips_network() {
        let network = EchoNetwork::new(true);
        let worker = worker(network.clone());
        worker.install().await.unwrap();
        let before = network.calls.load(Ordering::SeqCst);

        let logo = Request::get(origin().join("/static/logo.png").unwrap());
        let outcome = worker.handle_fetch(&logo).await.unwrap();

        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
        assert_eq!(network.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_stale_bucket_served_until_purged() {
        let network = EchoNetwork::new(true);
        let worker = worker(network.clone());
        let old = Request::get(origin().join("/static/old.css").unwrap());
        {
            let mut storage = worker.caches.write().await;
            let response = Response::new(old.url.clone(), StatusCode::OK, "v0 styles");
            storage.open("bellari-pwa-v0").put(&old, &response).unwrap();
            storage.open("bellari-pwa-v1");
        }

        let outcome = worker.handle_fetch(&old).await.unwrap();
        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
        assert_eq!(network.calls.load(Ordering::SeqCst), 0);

        worker.purge_stale_caches().await.unwrap();
        let outcome = worker.handle_fetch(&old).await.unwrap();
        assert_eq!(outcome.source(), Some(ResponseSource::Network));
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_navigation_prefers_network() {
        let network = EchoNetwork::new(true);
        let worker = worker(network.clone());
        worker.install().await.unwrap();

        let page = Request::navigate(origin().join("/").unwrap());
        let outcome = worker.handle_fetch(&page).await.unwrap();
        assert_eq!(outcome.source(), Some(ResponseSource::Network));
    }

    #[tokio::test]
    async fn test_offline_navigation_without_shell_fails() {
        let worker = worker(EchoNetwork::new(false));
        let page = Request::navigate(origin().join("/about").unwrap());
        assert!(matches!(
            worker.handle_fetch(&page).await,
            Err(ServiceWorkerError::FetchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_mutating_request_untouched() {
        let network = EchoNetwork::new(true);
        let worker = worker(network.clone());
        let request = Request::get(origin().join("/contact").unwrap()).method(Method::DELETE);

        let outcome = worker.handle_fetch(&request).await.unwrap();
        assert!(outcome.is_passthrough());
        assert_eq!(network.calls.load(Ordering::SeqCst), 0);
    }
}
