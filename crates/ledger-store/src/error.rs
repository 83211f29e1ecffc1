use ledger_crypto::EncryptionError;
use ledger_types::TypeError;

/// Status of a storage operation.
///
/// `NotFound` is often transient at a higher layer, `DataIntegrity` is never
/// retried, and `Network` is only retried by the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// A commit, object or row is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A key is absent from a commit's contents.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A hash mismatch or a malformed serialized structure.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// The underlying database failed.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// The caller violated an operation's contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote fetch failed.
    #[error("network error: {0}")]
    Network(String),

    /// The operation was cancelled before completing.
    #[error("interrupted")]
    Interrupted,

    #[error("illegal state: {0}")]
    IllegalState(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<TypeError> for StorageError {
    fn from(e: TypeError) -> Self {
        Self::DataIntegrity(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        Self::DataIntegrity(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<EncryptionError> for StorageError {
    fn from(e: EncryptionError) -> Self {
        match e {
            EncryptionError::Network(m) | EncryptionError::Auth(m) => Self::Network(m),
            EncryptionError::InvalidArgument(m) => Self::InvalidArgument(m),
            EncryptionError::Io(m) => Self::Io(m),
            EncryptionError::Internal(m) => Self::Internal(m),
        }
    }
}
