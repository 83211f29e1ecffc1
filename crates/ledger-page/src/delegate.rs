use async_trait::async_trait;
use bytes::Bytes;

use ledger_store::StorageResult;
use ledger_types::{ChangeSource, IsObjectSynced, ObjectIdentifier};

/// What a fetched object will be used as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetrievedObjectType {
    TreeNode,
    Blob,
}

/// A piece handed back by a [`PageSyncDelegate`].
#[derive(Clone, Debug)]
pub struct RemotePiece {
    pub source: ChangeSource,
    pub is_synced: IsObjectSynced,
    pub data: Bytes,
}

/// Source of pieces missing locally, implemented by the sync layer.
///
/// Page storage holds its delegate weakly; a dropped delegate reads as
/// "no delegate".
#[async_trait]
pub trait PageSyncDelegate: Send + Sync {
    async fn get_object(
        &self,
        identifier: &ObjectIdentifier,
        retrieved_type: RetrievedObjectType,
    ) -> StorageResult<RemotePiece>;
}
