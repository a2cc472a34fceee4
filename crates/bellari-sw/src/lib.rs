//! # Bellari Service Worker
//!
//! Offline cache worker for the Bellari PWA shell.
//!
//! ## Features
//!
//! - **Lifecycle**: install (seed the app shell), activate (drop stale
//!   buckets, claim clients), fetch interception
//! - **Cache API**: versioned buckets of GET responses, `addAll` semantics
//! - **Intercept policy**: network-first navigations with an offline app-shell
//!   fallback, cache-first assets, passthrough for admin and mutating calls
//! - **Clients API**: controlled pages and `clients.claim()`
//! - **Install banner**: the add-to-home-screen prompt state
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (navigator.serviceWorker)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       │       └── OfflineCacheWorker ── InterceptPolicy
//!     │       └── scope
//!     ├── Clients
//!     └── CacheStorage (caches)
//!             └── Cache "bellari-pwa-v1"
//!                     └── GET url → CacheEntry
//! ```

use bellari_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod install_prompt;
pub mod lifecycle;
pub mod policy;
pub mod worker;

pub use cache::{Cache, CacheBackend, CacheEntry, CacheStorage, SharedCacheStorage};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{WorkerConfig, CACHE_NAME, OFFLINE_FALLBACK, SEED_ASSETS};
pub use container::{RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent};
pub use install_prompt::{InstallBanner, InstallOutcome, Platform, PromptStore};
pub use lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
pub use policy::{InterceptPolicy, PassthroughReason, RequestClass, Strategy, ADMIN_ROUTE_MARKER};
pub use worker::{FetchOutcome, OfflineCacheWorker, ResponseSource};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install of {cache} failed")]
    InstallFailed {
        cache: String,
        #[source]
        source: Box<ServiceWorkerError>,
    },

    #[error("Fetch of {url} failed")]
    FetchFailed {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
