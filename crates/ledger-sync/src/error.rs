use ledger_crypto::EncryptionError;
use ledger_store::StorageError;
use ledger_types::CommitId;

use crate::cloud::CloudError;

/// Failure of a sync operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Remote commits whose parents are unknown locally.
    #[error("remote commits have {} unknown parents", .0.len())]
    MissingParents(Vec<CommitId>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether retrying can never succeed. Only network and authentication
    /// failures of the cloud or the encryption layer are transient.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Cloud(e) => e.is_permanent(),
            Self::Encryption(e) => e.is_permanent(),
            _ => true,
        }
    }
}
