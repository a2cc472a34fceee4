//! # Bellari Common
//!
//! Shared plumbing for the Bellari PWA worker crates.
//!
//! ## Features
//!
//! - Unified error type with source chains
//! - Logging configuration and setup
//! - JSON state and config files under the user cache directory

use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{default_state_dir, default_state_file, load_json, save_json};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for the Bellari tooling.
#[derive(Error, Debug)]
pub enum BellariError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Persisted state could not be read or written.
    #[error("State file error at {path}: {message}")]
    State {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Logging could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),
}

impl BellariError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a state file error with source.
    pub fn state<E: std::error::Error + Send + Sync + 'static>(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::State {
            path: path.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            BellariError::Config { .. } => "config",
            BellariError::State { .. } => "state",
            BellariError::Logging(_) => "logging",
        }
    }
}

/// Result type alias for Bellari operations.
pub type Result<T> = std::result::Result<T, BellariError>;
