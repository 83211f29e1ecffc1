use serde::{Deserialize, Serialize};

use ledger_store::{StorageError, StorageResult};

/// When obsolete commits are removed from local storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningPolicy {
    /// Keep every commit.
    #[default]
    Never,
    /// After each ingestion, drop synced commits that precede the latest
    /// unique common ancestor of the heads.
    LocalImmediate,
}

/// Configuration of one page storage instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageStorageConfig {
    pub pruning_policy: PruningPolicy,
    /// Ingestions an orphan commit is retried in before it is dropped.
    pub max_orphan_attempts: u32,
    /// Orphans held at once; the oldest are dropped first.
    pub max_orphans: usize,
}

impl Default for PageStorageConfig {
    fn default() -> Self {
        Self {
            pruning_policy: PruningPolicy::Never,
            max_orphan_attempts: 10,
            max_orphans: 1000,
        }
    }
}

impl PageStorageConfig {
    pub fn from_toml_str(s: &str) -> StorageResult<Self> {
        toml::from_str(s).map_err(|e| StorageError::InvalidArgument(format!("page storage config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = PageStorageConfig::from_toml_str("pruning_policy = \"local_immediate\"").unwrap();
        assert_eq!(config.pruning_policy, PruningPolicy::LocalImmediate);
        assert_eq!(config.max_orphan_attempts, 10);
        assert_eq!(PageStorageConfig::from_toml_str("").unwrap(), PageStorageConfig::default());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(matches!(
            PageStorageConfig::from_toml_str("pruning_policy = \"sometimes\""),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
