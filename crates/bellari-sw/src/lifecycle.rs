//! Worker versions and their registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::worker::OfflineCacheWorker;
use crate::{Result, ServiceWorkerError};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker version.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    runtime: Arc<OfflineCacheWorker>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, runtime: Arc<OfflineCacheWorker>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            runtime,
        }
    }

    /// Handlers for this version.
    pub fn runtime(&self) -> &Arc<OfflineCacheWorker> {
        &self.runtime
    }

    /// Cache bucket owned by this version.
    pub fn cache_name(&self) -> &str {
        self.runtime.cache_name()
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), from = ?self.state, to = ?state, "State change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Whether `url` falls inside this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new version.
    ///
    /// A version already installing is superseded and becomes redundant.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        self.last_update_check = Some(Instant::now());
        self.installing.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<()> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut old) = self.waiting.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
        }
        Ok(())
    }

    /// Discard a version whose install failed. The active worker is kept.
    pub fn install_failed(&mut self, id: ServiceWorkerId, reason: &str) -> Result<ServiceWorker> {
        let mut worker = self.take_installing(id)?;
        worker.error = Some(reason.to_string());
        worker.set_state(ServiceWorkerState::Redundant);
        Ok(worker)
    }

    /// Promote the waiting worker to active (`Activating`).
    ///
    /// Returns the previous active worker, now redundant.
    pub fn begin_activation(&mut self, id: ServiceWorkerId) -> Result<Option<ServiceWorker>> {
        let mut worker = match self.waiting.take() {
            Some(w) if w.id == id => w,
            other => {
                self.waiting = other;
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} is not waiting",
                    id.raw()
                )));
            }
        };
        worker.set_state(ServiceWorkerState::Activating);

        let previous = self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok(previous)
    }

    /// Mark the active worker as `Activated`.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> Result<()> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => {
                if worker.state != ServiceWorkerState::Activated {
                    worker.set_state(ServiceWorkerState::Activated);
                }
                Ok(())
            }
            _ => Err(ServiceWorkerError::StateError(format!(
                "worker {} is not the active worker",
                id.raw()
            ))),
        }
    }

    /// Unregister (mark everything redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker> {
        match self.installing.take() {
            Some(w) if w.id == id => Ok(w),
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(format!(
                    "worker {} is not installing",
                    id.raw()
                )))
            }
        }
    }
}
