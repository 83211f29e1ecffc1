use ledger_store::StorageError;

/// Failure of a merge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The merge was cancelled, usually by a strategy change.
    #[error("merge interrupted")]
    Interrupted,
}

pub type MergeResult<T> = Result<T, MergeError>;

impl MergeError {
    /// Whether the merge failed only because remote data was unreachable.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Network(_)))
    }
}
