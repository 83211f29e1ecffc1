use serde::{Deserialize, Serialize};

use ledger_types::BackoffConfig;

use crate::error::{SyncError, SyncResult};

/// Settings of the sync of one page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delays between retries of transient failures.
    pub backoff: BackoffConfig,
    /// Attempts at fetching one object before giving up.
    pub max_get_object_attempts: u32,
    /// Pieces uploaded concurrently.
    pub upload_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_get_object_attempts: 5,
            upload_concurrency: 4,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        if config.upload_concurrency == 0 {
            return Err(SyncError::Config(
                "upload_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
