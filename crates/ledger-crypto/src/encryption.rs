use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ledger_types::{CommitId, ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory};

/// Errors from the encryption layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EncryptionError {
    /// Whether retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::Network(_))
    }
}

/// Result alias for encryption operations.
pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Bijection applied to the rolling hash before chunk boundaries are chosen.
#[derive(Clone)]
pub struct ChunkingPermutation(Arc<dyn Fn(u64) -> u64 + Send + Sync>);

impl ChunkingPermutation {
    pub fn new(f: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// The identity permutation.
    pub fn identity() -> Self {
        Self::new(|x| x)
    }

    pub fn apply(&self, value: u64) -> u64 {
        (self.0)(value)
    }
}

impl fmt::Debug for ChunkingPermutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkingPermutation")
    }
}

/// Encryption contract between page storage and everything that leaves the
/// device.
///
/// Implementations must be deterministic where convergence depends on it:
/// identifiers, object names, chunking permutations and merge entry ids are
/// pure functions of their inputs for a given key.
#[async_trait]
pub trait EncryptionService: Send + Sync {
    /// Mint the identifier of a locally computed digest.
    fn make_object_identifier(
        &self,
        factory: &ObjectIdentifierFactory,
        digest: ObjectDigest,
    ) -> ObjectIdentifier;

    async fn encrypt_commit(&self, commit_storage: &[u8]) -> EncryptionResult<Vec<u8>>;

    async fn decrypt_commit(&self, encrypted: &[u8]) -> EncryptionResult<Vec<u8>>;

    /// Cloud-visible name of an object.
    async fn get_object_name(&self, identifier: &ObjectIdentifier) -> EncryptionResult<String>;

    async fn encrypt_object(
        &self,
        identifier: &ObjectIdentifier,
        content: &[u8],
    ) -> EncryptionResult<Vec<u8>>;

    async fn decrypt_object(
        &self,
        identifier: &ObjectIdentifier,
        encrypted: &[u8],
    ) -> EncryptionResult<Vec<u8>>;

    async fn get_chunking_permutation(&self) -> EncryptionResult<ChunkingPermutation>;

    /// A fresh entry id for a local change.
    fn get_entry_id(&self) -> Vec<u8>;

    /// The entry id of a change made while merging two parents. Every device
    /// computes the same id for the same inputs.
    fn get_entry_id_for_merge(
        &self,
        entry_name: &str,
        left_parent_id: &CommitId,
        right_parent_id: &CommitId,
        operation_list: &str,
    ) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_not_permanent() {
        assert!(!EncryptionError::Network("down".into()).is_permanent());
        assert!(!EncryptionError::Auth("expired".into()).is_permanent());
        assert!(EncryptionError::InvalidArgument("bad".into()).is_permanent());
        assert!(EncryptionError::Io("disk".into()).is_permanent());
        assert!(EncryptionError::Internal("bug".into()).is_permanent());
    }

    #[test]
    fn identity_permutation() {
        let p = ChunkingPermutation::identity();
        assert_eq!(p.apply(42), 42);
    }
}
