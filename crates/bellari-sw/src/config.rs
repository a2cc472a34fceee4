//! Worker configuration.
//!
//! The cache name embeds the deployment version. Bumping it is the only way
//! to invalidate everything previously cached.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Current cache bucket.
pub const CACHE_NAME: &str = "bellari-pwa-v1";

/// App shell stored at install time.
pub const SEED_ASSETS: &[&str] = &["/", "/static/logo.png"];

/// Served to navigations when offline and the page itself is not cached.
pub const OFFLINE_FALLBACK: &str = "/";

/// Configuration for one worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Origin the worker is registered for.
    pub origin: Url,

    /// Cache bucket owned by this version.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Absolute paths stored at install time, in order.
    #[serde(default = "default_seed_assets")]
    pub seed_assets: Vec<String>,

    /// Absolute path used as the offline navigation fallback.
    #[serde(default = "default_offline_fallback")]
    pub offline_fallback: String,
}

fn default_cache_name() -> String {
    CACHE_NAME.to_string()
}

fn default_seed_assets() -> Vec<String> {
    SEED_ASSETS.iter().map(|s| s.to_string()).collect()
}

fn default_offline_fallback() -> String {
    OFFLINE_FALLBACK.to_string()
}

impl WorkerConfig {
    /// Configuration with the built-in cache name and seed list.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            cache_name: default_cache_name(),
            seed_assets: default_seed_assets(),
            offline_fallback: default_offline_fallback(),
        }
    }

    /// Replace the cache name (a new deployment version).
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replace the seed list.
    pub fn with_seed_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::ConfigError(format!(
                "origin must be http(s), got {}",
                self.origin
            )));
        }
        if self.cache_name.is_empty() {
            return Err(ServiceWorkerError::ConfigError("empty cache name".into()));
        }
        if let Some(bad) = self.seed_assets.iter().find(|p| !p.starts_with('/')) {
            return Err(ServiceWorkerError::ConfigError(format!(
                "seed asset {bad:?} is not an absolute path"
            )));
        }
        if !self.seed_assets.contains(&self.offline_fallback) {
            return Err(ServiceWorkerError::ConfigError(format!(
                "offline fallback {:?} is not in the seed list",
                self.offline_fallback
            )));
        }
        Ok(())
    }

    /// Resolve a path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("{path}: {e}")))
    }

    /// Seed list resolved to absolute URLs.
    pub fn seed_urls(&self) -> Result<Vec<Url>> {
        self.seed_assets.iter().map(|p| self.resolve(p)).collect()
    }

    /// Offline fallback resolved to an absolute URL.
    pub fn fallback_url(&self) -> Result<Url> {
        self.resolve(&self.offline_fallback)
    }
}
