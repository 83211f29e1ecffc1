use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use ledger_crypto::compute_object_digest;
use ledger_store::{ObjectReferences, StorageError, StorageResult};
use ledger_types::{
    Entry, KeyPriority, Location, ObjectIdentifier, ObjectIdentifierFactory, ObjectType,
    PieceType,
};

/// Tree nodes kept in a map; counts reads so tests can observe skipping.
#[derive(Default)]
pub(crate) struct MemoryTreeStorage {
    factory: ObjectIdentifierFactory,
    nodes: Mutex<HashMap<Vec<u8>, Bytes>>,
    pub(crate) reads: AtomicUsize,
}

impl MemoryTreeStorage {
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.lock().expect("lock poisoned").len()
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn value(&self, content: &str) -> ObjectIdentifier {
        let digest = compute_object_digest(PieceType::Chunk, ObjectType::Blob, content.as_bytes());
        self.factory.make_object_identifier(0, 0, digest)
    }

    pub(crate) fn entry(&self, key: &str, value: &str) -> Entry {
        Entry::new(key, self.value(value), KeyPriority::Eager, key.as_bytes().to_vec())
    }
}

#[async_trait]
impl crate::TreeStorage for MemoryTreeStorage {
    fn identifier_factory(&self) -> &ObjectIdentifierFactory {
        &self.factory
    }

    async fn get_tree_node_data(
        &self,
        identifier: &ObjectIdentifier,
        _location: Location,
    ) -> StorageResult<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(data) = identifier.digest().inlined_data() {
            return Ok(Bytes::copy_from_slice(data));
        }
        self.nodes
            .lock()
            .expect("lock poisoned")
            .get(identifier.digest().as_bytes())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{identifier:?}")))
    }

    async fn add_tree_node(
        &self,
        data: Bytes,
        _references: ObjectReferences,
    ) -> StorageResult<ObjectIdentifier> {
        let digest = compute_object_digest(PieceType::Chunk, ObjectType::TreeNode, &data);
        if !digest.is_inlined() {
            self.nodes
                .lock()
                .expect("lock poisoned")
                .insert(digest.as_bytes().to_vec(), data);
        }
        Ok(self.factory.make_object_identifier(0, 0, digest))
    }
}
