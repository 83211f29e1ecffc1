use async_trait::async_trait;
use bytes::Bytes;

use ledger_store::{ObjectReferences, StorageResult};
use ledger_types::{Location, ObjectIdentifier, ObjectIdentifierFactory};

use crate::node::TreeNode;

/// Object access the tree needs from page storage.
#[async_trait]
pub trait TreeStorage: Send + Sync {
    /// Factory that decodes identifiers embedded in nodes.
    fn identifier_factory(&self) -> &ObjectIdentifierFactory;

    /// Full content of a tree node object, fetched remotely if `location`
    /// allows it.
    async fn get_tree_node_data(
        &self,
        identifier: &ObjectIdentifier,
        location: Location,
    ) -> StorageResult<Bytes>;

    /// Store a serialized node with its tree-level references.
    async fn add_tree_node(
        &self,
        data: Bytes,
        references: ObjectReferences,
    ) -> StorageResult<ObjectIdentifier>;
}

/// Load and decode one node.
pub async fn read_node(
    storage: &dyn TreeStorage,
    identifier: &ObjectIdentifier,
    location: Location,
) -> StorageResult<TreeNode> {
    let data = storage.get_tree_node_data(identifier, location).await?;
    TreeNode::decode(storage.identifier_factory(), &data)
}

/// Encode and store one node.
pub async fn write_node(storage: &dyn TreeStorage, node: &TreeNode) -> StorageResult<ObjectIdentifier> {
    let data = node.encode()?;
    storage.add_tree_node(Bytes::from(data), node.references()).await
}
