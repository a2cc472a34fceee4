//! Service worker container (navigator.serviceWorker).
//!
//! Drives each worker version through install and activation and routes
//! fetch events to the active worker that controls them.

use std::sync::Arc;

use bellari_net::{Network, Request};
use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, SharedCacheStorage};
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::lifecycle::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::policy::PassthroughReason;
use crate::worker::{FetchOutcome, OfflineCacheWorker};
use crate::{Result, ServiceWorkerError};

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope, resolved against the script URL. Defaults to the script's
    /// directory.
    pub scope: Option<String>,
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Update found.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A stale cache bucket was deleted during activation.
    CacheDeleted { name: String },
}

/// Service worker container.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Cache storage.
    pub caches: SharedCacheStorage,

    /// Clients.
    pub clients: Arc<RwLock<Clients>>,

    network: Arc<dyn Network>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container with empty cache storage.
    pub fn new(network: Arc<dyn Network>) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        Self::with_caches(network, CacheStorage::new().shared())
    }

    /// Create a container over existing cache storage.
    pub fn with_caches(
        network: Arc<dyn Network>,
        caches: SharedCacheStorage,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches,
                clients: Arc::new(RwLock::new(Clients::new())),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    /// Register a worker version, install it and, since it skips waiting,
    /// activate it.
    ///
    /// If install fails the new version becomes redundant and the previous
    /// active worker keeps control.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        config: WorkerConfig,
    ) -> Result<ServiceWorkerId> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if script_url.origin() != config.origin.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "script {script_url} is not same-origin with {}",
                config.origin
            )));
        }

        let scope = script_url
            .join(options.scope.as_deref().unwrap_or("./"))
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "scope {scope} is not same-origin with the script"
            )));
        }
        let scope_str = scope.to_string();

        let runtime = Arc::new(OfflineCacheWorker::new(
            config,
            Arc::clone(&self.caches),
            Arc::clone(&self.network),
        )?);
        let worker = ServiceWorker::new(script_url, Arc::clone(&runtime));
        let id = worker.id;

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));
            if let Some(superseded) = registration.begin_install(worker) {
                self.emit_state(&scope_str, superseded.id, superseded.state);
            }
        }
        let _ = self.event_tx.send(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });
        self.emit_state(&scope_str, id, ServiceWorkerState::Installing);

        let installed = runtime.install().await;

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations.get_mut(&scope_str).ok_or_else(|| {
                ServiceWorkerError::StateError(format!("{scope_str} unregistered during install"))
            })?;
            match installed {
                Ok(_) => {
                    registration.install_complete(id)?;
                    self.emit_state(&scope_str, id, ServiceWorkerState::Installed);
                }
                Err(e) => {
                    warn!(scope = %scope_str, error = %e, "Install failed, keeping previous worker");
                    registration.install_failed(id, &e.to_string())?;
                    self.emit_state(&scope_str, id, ServiceWorkerState::Redundant);
                    return Err(e);
                }
            }
        }

        self.skip_waiting(&scope_str, id).await?;
        Ok(id)
    }

    /// Promote the waiting worker without waiting for clients to close.
    async fn skip_waiting(&self, scope: &str, id: ServiceWorkerId) -> Result<()> {
        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            if let Some(previous) = registration.begin_activation(id)? {
                self.clients.write().await.release(previous.id);
                self.emit_state(scope, previous.id, previous.state);
            }
        }
        self.emit_state(scope, id, ServiceWorkerState::Activating);

        self.run_activation(scope, id).await
    }

    /// Re-run the activate handler of the active worker.
    ///
    /// Used to retry after a failed activation. With an unchanged cache name
    /// it deletes nothing and leaves clients claimed.
    pub async fn activate(&self, scope: &str) -> Result<()> {
        let id = {
            let registrations = self.registrations.read().await;
            registrations
                .get(scope)
                .and_then(|r| r.get_active())
                .map(|w| w.id)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?
        };
        self.run_activation(scope, id).await
    }

    /// Activate handler: purge stale buckets and claim clients, both awaited
    /// before the worker counts as activated.
    async fn run_activation(&self, scope: &str, id: ServiceWorkerId) -> Result<()> {
        let (runtime, scope_url) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            match registration.get_active() {
                Some(worker) if worker.id == id => {
                    (Arc::clone(worker.runtime()), registration.scope.clone())
                }
                _ => {
                    return Err(ServiceWorkerError::StateError(format!(
                        "worker {} is not active in {scope}",
                        id.raw()
                    )))
                }
            }
        };

        let claim = async {
            let claimed = self.clients.write().await.claim(&scope_url, id);
            Ok::<_, ServiceWorkerError>(claimed)
        };
        let (deleted, claimed) = tokio::try_join!(runtime.purge_stale_caches(), claim)?;

        for name in deleted {
            let _ = self.event_tx.send(ServiceWorkerEvent::CacheDeleted { name });
        }
        for client_id in claimed {
            let _ = self
                .event_tx
                .send(ServiceWorkerEvent::ControllerChange { client_id, worker_id: id });
        }

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            registration.finish_activation(id)?;
        }
        self.emit_state(scope, id, ServiceWorkerState::Activated);
        info!(scope = %scope, cache = %runtime.cache_name(), "Worker activated");
        Ok(())
    }

    /// Open a page. It is controlled straight away if an activated worker's
    /// scope covers it.
    pub async fn open_client(&self, url: &str) -> Result<Client> {
        let registrations = self.registrations.read().await;
        let mut clients = self.clients.write().await;
        let mut client = clients.open_window(url)?;

        if let Some(worker) = Self::controlling_worker(&registrations, &client.url) {
            clients.set_controller(&client.id, Some(worker.id))?;
            client.controller = Some(worker.id);
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client.id.clone(),
                worker_id: worker.id,
            });
        }
        Ok(client)
    }

    /// Route a fetch event.
    ///
    /// Navigations go to the activated worker whose scope covers the URL;
    /// subresource requests go to the controller of the client that made them.
    pub async fn dispatch_fetch(
        &self,
        client_id: Option<&str>,
        request: &Request,
    ) -> Result<FetchOutcome> {
        let runtime = {
            let registrations = self.registrations.read().await;
            let worker = if request.is_navigation() {
                Self::controlling_worker(&registrations, &request.url)
            } else {
                let controller = match client_id {
                    Some(id) => self.clients.read().await.controller_of(id),
                    None => None,
                };
                controller.and_then(|controller| {
                    registrations
                        .values()
                        .filter_map(|r| r.get_active())
                        .find(|w| w.id == controller && w.is_active())
                })
            };

            match worker {
                Some(worker) => Arc::clone(worker.runtime()),
                None => return Ok(FetchOutcome::Passthrough(PassthroughReason::Uncontrolled)),
            }
        };

        runtime.handle_fetch(request).await
    }

    /// Get the scope of the registration covering a URL.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.in_scope(&url))
            .max_by_key(|r| r.scope.as_str().len())
            .map(|r| r.scope.to_string())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Snapshot of the active worker for a scope.
    pub async fn active_worker(&self, scope: &str) -> Option<ServiceWorker> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.get_active())
            .cloned()
    }

    /// Unregister a service worker. Its clients become uncontrolled.
    pub async fn unregister(&self, scope: &str) -> Result<bool> {
        let mut registrations = self.registrations.write().await;
        let Some(mut registration) = registrations.remove(scope) else {
            return Ok(false);
        };
        if let Some(active) = registration.get_active() {
            self.clients.write().await.release(active.id);
        }
        registration.unregister();
        info!(scope = %scope, "Unregistered");
        Ok(true)
    }

    fn controlling_worker<'a>(
        registrations: &'a HashMap<String, ServiceWorkerRegistration>,
        url: &Url,
    ) -> Option<&'a ServiceWorker> {
        registrations
            .values()
            .filter(|r| r.in_scope(url))
            .max_by_key(|r| r.scope.as_str().len())
            .and_then(|r| r.get_active())
            .filter(|w| w.is_active())
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBackend;
    use async_trait::async_trait;
    use bellari_net::{NetError, Response};
    use http::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct SwitchNetwork {
        online: AtomicBool,
    }

    #[async_trait]
    impl Network for SwitchNetwork {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            if self.online.load(Ordering::SeqCst) {
                Ok(Response::new(request.url.clone(), StatusCode::OK, &b"live"[..]))
            } else {
                Err(NetError::Offline("switched off".into()))
            }
        }
    }

    const SCRIPT: &str = "https://bellari.example/static/sw.js";

    fn setup(online: bool) -> (ServiceWorkerContainer, Arc<SwitchNetwork>) {
        let network = Arc::new(SwitchNetwork {
            online: AtomicBool::new(online),
        });
        let (container, _rx) = ServiceWorkerContainer::new(network.clone());
        (container, network)
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(Url::parse("https://bellari.example/").unwrap())
    }

    fn root_scope() -> RegistrationOptions {
        RegistrationOptions {
            scope: Some("/".into()),
        }
    }

    #[tokio::test]
    async fn test_default_scope_is_script_directory() {
        let (container, _) = setup(true);
        container
            .register(SCRIPT, RegistrationOptions::default(), config())
            .await
            .unwrap();

        assert_eq!(
            container.get_registrations().await,
            vec!["https://bellari.example/static/".to_string()]
        );
    }

    #[tokio::test]
    async fn test_register_activates() {
        let (container, _) = setup(true);
        let id = container.register(SCRIPT, root_scope(), config()).await.unwrap();

        let active = container.active_worker("https://bellari.example/").await.unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.state, ServiceWorkerState::Activated);
    }

    #[tokio::test]
    async fn test_cross_origin_script_rejected() {
        let (container, _) = setup(true);
        let err = container
            .register("https://evil.example/sw.js", root_scope(), config())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::RegistrationFailed(_)));
    }

    #[tokio::test]
    async fn test_uncontrolled_subresource_passes_through() {
        let (container, _) = setup(true);
        let page = container.open_client("https://bellari.example/").await.unwrap();
        assert!(page.controller.is_none());

        let logo = Request::get(Url::parse("https://bellari.example/static/logo.png").unwrap());
        let outcome = container.dispatch_fetch(Some(&page.id), &logo).await.unwrap();
        assert!(matches!(
            outcome,
            FetchOutcome::Passthrough(PassthroughReason::Uncontrolled)
        ));
    }

    #[tokio::test]
    async fn test_existing_pages_are_claimed() {
        let (container, _) = setup(true);
        let page = container.open_client("https://bellari.example/services").await.unwrap();

        let id = container.register(SCRIPT, root_scope(), config()).await.unwrap();
        assert_eq!(container.clients.read().await.controller_of(&page.id), Some(id));

        // Re-activation with the same cache name changes nothing.
        container.activate("https://bellari.example/").await.unwrap();
        assert_eq!(container.clients.read().await.controller_of(&page.id), Some(id));
        assert_eq!(container.caches.read().await.keys(), vec!["bellari-pwa-v1"]);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_old_worker() {
        let (container, network) = setup(true);
        let v1 = container.register(SCRIPT, root_scope(), config()).await.unwrap();

        network.online.store(false, Ordering::SeqCst);
        let v2 = container
            .register(SCRIPT, root_scope(), config().with_cache_name("bellari-pwa-v2"))
            .await;
        assert!(matches!(v2, Err(ServiceWorkerError::InstallFailed { .. })));

        let active = container.active_worker("https://bellari.example/").await.unwrap();
        assert_eq!(active.id, v1);
        assert_eq!(active.cache_name(), "bellari-pwa-v1");
    }

    /// Refuses the first `refusals` deletions.
    #[derive(Debug)]
    struct FlakyBackend {
        refusals: AtomicUsize,
    }

    impl CacheBackend for FlakyBackend {
        fn remove(&self, name: &str) -> Result<()> {
            let left = self.refusals.load(Ordering::SeqCst);
            if left > 0 {
                self.refusals.store(left - 1, Ordering::SeqCst);
                return Err(ServiceWorkerError::CacheError(format!("{name} is busy")));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_activation_retried() {
        let network = Arc::new(SwitchNetwork {
            online: AtomicBool::new(true),
        });
        let mut storage = CacheStorage::new().with_backend(Arc::new(FlakyBackend {
            refusals: AtomicUsize::new(1),
        }));
        storage.open("bellari-pwa-v0");
        let (container, _rx) = ServiceWorkerContainer::with_caches(network, storage.shared());
        let scope = "https://bellari.example/";

        let err = container
            .register(SCRIPT, root_scope(), config())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::CacheError(_)));

        let stuck = container.active_worker(scope).await.unwrap();
        assert_eq!(stuck.state, ServiceWorkerState::Activating);
        assert_eq!(
            container.caches.read().await.keys(),
            vec!["bellari-pwa-v0", "bellari-pwa-v1"]
        );

        // Not activated, so navigations are left alone.
        let page = Request::navigate(Url::parse(scope).unwrap());
        assert!(container
            .dispatch_fetch(None, &page)
            .await
            .unwrap()
            .is_passthrough());

        container.activate(scope).await.unwrap();

        let active = container.active_worker(scope).await.unwrap();
        assert_eq!(active.id, stuck.id);
        assert_eq!(active.state, ServiceWorkerState::Activated);
        assert_eq!(container.caches.read().await.keys(), vec!["bellari-pwa-v1"]);
    }

    #[tokio::test]
    async fn test_unregister_releases_clients() {
        let (container, _) = setup(true);
        container.register(SCRIPT, root_scope(), config()).await.unwrap();
        let page = container.open_client("https://bellari.example/").await.unwrap();
        assert!(page.controller.is_some());

        assert!(container.unregister("https://bellari.example/").await.unwrap());
        assert!(!container.unregister("https://bellari.example/").await.unwrap());
        assert!(container.clients.read().await.controller_of(&page.id).is_none());
    }
}
