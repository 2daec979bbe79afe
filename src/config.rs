use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_CACHE_LOG_NAME: &str = "blobsCache";
const DEFAULT_QUARANTINE_NAME: &str = "doNotUseBlobs";

/// Where the persistent blob cache and quarantine live on disk.
///
/// The host process owns and supplies this (no XDG/home-directory
/// guessing here): that discovery logic belongs to the CLI or daemon
/// that sits outside this crate's scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Process-private directory the cache log and quarantine files
    /// live in. Created on first write if it doesn't exist yet.
    pub state_dir: PathBuf,
    #[serde(default = "default_cache_log_name")]
    pub cache_log_name: String,
    #[serde(default = "default_quarantine_name")]
    pub quarantine_name: String,
}

fn default_cache_log_name() -> String {
    DEFAULT_CACHE_LOG_NAME.to_string()
}

fn default_quarantine_name() -> String {
    DEFAULT_QUARANTINE_NAME.to_string()
}

impl RepositoryConfig {
    pub fn new<P: Into<PathBuf>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.into(),
            cache_log_name: DEFAULT_CACHE_LOG_NAME.to_string(),
            quarantine_name: DEFAULT_QUARANTINE_NAME.to_string(),
        }
    }

    pub fn cache_log_path(&self) -> PathBuf {
        self.state_dir.join(&self.cache_log_name)
    }

    pub fn quarantine_path(&self) -> PathBuf {
        self.state_dir.join(&self.quarantine_name)
    }
}

/// Validate the one external knob the check operation takes.
pub fn validate_percent(percent: u8) -> crate::error::Result<()> {
    if percent > 100 {
        return Err(crate::error::CoreError::InvalidArgument(format!(
            "percent must be between 0 and 100, got {percent}"
        )));
    }
    Ok(())
}
