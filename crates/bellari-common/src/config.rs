//! JSON config and state files.

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{BellariError, Result};

const STATE_DIR_NAME: &str = "bellari";
const STATE_FILE_NAME: &str = "sw-caches.json";

/// Directory holding persisted worker state.
pub fn default_state_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Default location of the persisted cache storage snapshot.
pub fn default_state_file() -> PathBuf {
    default_state_dir().join(STATE_FILE_NAME)
}

/// Read a JSON document. Returns `Ok(None)` if the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No state file yet");
            return Ok(None);
        }
        Err(e) => return Err(BellariError::state(path, "read failed", e)),
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| BellariError::state(path, "invalid JSON", e))
}

/// Write a JSON document, creating parent directories.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| BellariError::state(parent, "mkdir failed", e))?;
    }

    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| BellariError::state(path, "serialize failed", e))?;
    fs::write(path, raw).map_err(|e| BellariError::state(path, "write failed", e))?;

    debug!(path = %path.display(), "State saved");
    Ok(())
}
