use serde::{Deserialize, Serialize};

use ledger_crypto::ContentHasher;
use ledger_store::{ObjectReferences, StorageError, StorageResult};
use ledger_types::{Entry, KeyPriority, ObjectIdentifier, ObjectIdentifierFactory};

/// Level of the node holding `key`: the number of leading zero bytes of its
/// hash. Levels depend only on the key, so the tree shape depends only on the
/// set of keys.
pub fn node_level(key: &str) -> u8 {
    let hash = ContentHasher::NODE_LEVEL.hash(key.as_bytes());
    hash.iter().take_while(|b| **b == 0).count() as u8
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: Vec<u8>,
    priority: KeyPriority,
    entry_id: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredNode {
    level: u8,
    entries: Vec<StoredEntry>,
    children: Vec<Option<Vec<u8>>>,
}

/// One node of the content B-tree.
///
/// `children[i]` holds the keys strictly between `entries[i - 1]` and
/// `entries[i]`, so there is always one more child slot than entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeNode {
    level: u8,
    entries: Vec<Entry>,
    children: Vec<Option<ObjectIdentifier>>,
}

impl TreeNode {
    pub fn new(
        level: u8,
        entries: Vec<Entry>,
        children: Vec<Option<ObjectIdentifier>>,
    ) -> StorageResult<Self> {
        if children.len() != entries.len() + 1 {
            return Err(StorageError::DataIntegrity(format!(
                "tree node with {} entries and {} children",
                entries.len(),
                children.len()
            )));
        }
        if entries.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(StorageError::DataIntegrity(
                "tree node entries are not strictly sorted".to_string(),
            ));
        }
        if level == 0 && children.iter().any(Option::is_some) {
            return Err(StorageError::DataIntegrity(
                "leaf tree node has children".to_string(),
            ));
        }
        Ok(Self {
            level,
            entries,
            children,
        })
    }

    /// The node of an empty tree.
    pub fn empty() -> Self {
        Self {
            level: 0,
            entries: Vec::new(),
            children: vec![None],
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn children(&self) -> &[Option<ObjectIdentifier>] {
        &self.children
    }

    /// Tree-level references: child nodes (eager) and values (by priority).
    pub fn references(&self) -> ObjectReferences {
        let mut refs = ObjectReferences::new();
        for entry in &self.entries {
            let digest = entry.object_identifier.digest();
            if !digest.is_inlined() {
                refs.insert(digest.clone(), entry.priority);
            }
        }
        for child in self.children.iter().flatten() {
            if !child.digest().is_inlined() {
                refs.insert(child.digest().clone(), KeyPriority::Eager);
            }
        }
        refs
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let stored = StoredNode {
            level: self.level,
            entries: self
                .entries
                .iter()
                .map(|e| StoredEntry {
                    key: e.key.clone(),
                    value: e.object_identifier.encode(),
                    priority: e.priority,
                    entry_id: e.entry_id.clone(),
                })
                .collect(),
            children: self
                .children
                .iter()
                .map(|c| c.as_ref().map(ObjectIdentifier::encode))
                .collect(),
        };
        Ok(bincode::serialize(&stored)?)
    }

    pub fn decode(factory: &ObjectIdentifierFactory, data: &[u8]) -> StorageResult<Self> {
        let stored: StoredNode = bincode::deserialize(data)
            .map_err(|e| StorageError::DataIntegrity(format!("malformed tree node: {e}")))?;
        let entries = stored
            .entries
            .into_iter()
            .map(|e| {
                Ok(Entry {
                    key: e.key,
                    object_identifier: factory.decode_object_identifier(&e.value)?,
                    priority: e.priority,
                    entry_id: e.entry_id,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let children = stored
            .children
            .into_iter()
            .map(|c| {
                c.map(|bytes| factory.decode_object_identifier(&bytes))
                    .transpose()
                    .map_err(StorageError::from)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Self::new(stored.level, entries, children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_types::{ObjectDigest, ObjectType, PieceType};

    fn value(factory: &ObjectIdentifierFactory, byte: u8) -> ObjectIdentifier {
        factory.make_object_identifier(
            0,
            0,
            ObjectDigest::hashed(PieceType::Chunk, ObjectType::Blob, [byte; 32]),
        )
    }

    fn entry(factory: &ObjectIdentifierFactory, key: &str, byte: u8) -> Entry {
        Entry::new(key, value(factory, byte), KeyPriority::Eager, vec![byte])
    }

    #[test]
    fn encode_decode_roundtrip() {
        let factory = ObjectIdentifierFactory::new();
        let node = TreeNode::new(
            1,
            vec![entry(&factory, "a", 1), entry(&factory, "m", 2)],
            vec![None, Some(value(&factory, 9)), None],
        )
        .unwrap();
        let decoded = TreeNode::decode(&factory, &node.encode().unwrap()).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn rejects_malformed_shapes() {
        let factory = ObjectIdentifierFactory::new();
        assert!(TreeNode::new(0, vec![entry(&factory, "a", 1)], vec![None]).is_err());
        assert!(TreeNode::new(
            0,
            vec![entry(&factory, "b", 1), entry(&factory, "a", 2)],
            vec![None, None, None]
        )
        .is_err());
        assert!(TreeNode::new(0, vec![], vec![Some(value(&factory, 1))]).is_err());
        assert!(TreeNode::decode(&factory, b"garbage").is_err());
    }

    #[test]
    fn references_cover_values_and_children() {
        let factory = ObjectIdentifierFactory::new();
        let mut lazy = entry(&factory, "k", 1);
        lazy.priority = KeyPriority::Lazy;
        let node = TreeNode::new(1, vec![lazy], vec![Some(value(&factory, 2)), None]).unwrap();
        let refs = node.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[value(&factory, 1).digest()], KeyPriority::Lazy);
        assert_eq!(refs[value(&factory, 2).digest()], KeyPriority::Eager);
    }

    #[test]
    fn levels_are_stable_and_mostly_zero() {
        assert_eq!(node_level("key"), node_level("key"));
        let high = (0..2000).filter(|i| node_level(&format!("k{i}")) > 0).count();
        assert!(high < 100);
    }
}
