use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ledger_types::{
    KeyPriority, ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, PieceType,
};

use crate::error::{StorageError, StorageResult};

/// Sync status of a persisted piece. Statuses only ever increase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectStatus {
    /// Written locally but not reachable from any commit yet.
    Transient,
    /// Reachable from a local commit, not yet uploaded.
    Local,
    /// Known to the cloud.
    Synced,
}

impl ObjectStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Transient => 0,
            Self::Local => 1,
            Self::Synced => 2,
        }
    }

    pub fn from_byte(byte: u8) -> StorageResult<Self> {
        match byte {
            0 => Ok(Self::Transient),
            1 => Ok(Self::Local),
            2 => Ok(Self::Synced),
            other => Err(StorageError::DataIntegrity(format!(
                "unknown object status {other}"
            ))),
        }
    }
}

/// Outgoing references of a piece, keyed by target digest.
///
/// Piece-level references (index to child) are always eager; tree-level
/// references (node to child node or value) carry the entry's priority.
pub type ObjectReferences = BTreeMap<ObjectDigest, KeyPriority>;

/// The smallest unit that can be read without further I/O.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Piece {
    identifier: ObjectIdentifier,
    data: Bytes,
}

impl Piece {
    pub fn new(identifier: ObjectIdentifier, data: Bytes) -> Self {
        Self { identifier, data }
    }

    /// The piece carried by an inlined identifier.
    pub fn from_inlined(identifier: &ObjectIdentifier) -> Option<Self> {
        let data = identifier.digest().inlined_data()?;
        Some(Self::new(identifier.clone(), Bytes::copy_from_slice(data)))
    }

    pub fn identifier(&self) -> &ObjectIdentifier {
        &self.identifier
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_index(&self) -> bool {
        self.identifier.digest().info().piece_type == PieceType::Index
    }

    /// Piece-level references: the non-inlined children of an index piece.
    pub fn piece_references(&self) -> StorageResult<ObjectReferences> {
        let mut refs = ObjectReferences::new();
        if !self.is_index() {
            return Ok(refs);
        }
        for child in FileIndex::decode(&self.data)?.children {
            let digest = ObjectDigest::from_bytes(child.digest)?;
            if !digest.is_inlined() {
                refs.insert(digest, KeyPriority::Eager);
            }
        }
        Ok(refs)
    }
}

/// A full value assembled from one or more pieces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    identifier: ObjectIdentifier,
    data: Bytes,
}

impl Object {
    pub fn new(identifier: ObjectIdentifier, data: Bytes) -> Self {
        Self { identifier, data }
    }

    pub fn identifier(&self) -> &ObjectIdentifier {
        &self.identifier
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// One child listed by a [`FileIndex`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexChild {
    pub key_index: u32,
    pub deletion_scope_id: u32,
    pub digest: Vec<u8>,
    /// Size of the content the child expands to.
    pub size: u64,
}

impl FileIndexChild {
    pub fn from_identifier(identifier: &ObjectIdentifier, size: u64) -> Self {
        Self {
            key_index: identifier.key_index(),
            deletion_scope_id: identifier.deletion_scope_id(),
            digest: identifier.digest().as_bytes().to_vec(),
            size,
        }
    }

    pub fn identifier(&self, factory: &ObjectIdentifierFactory) -> StorageResult<ObjectIdentifier> {
        let digest = ObjectDigest::from_bytes(self.digest.clone())?;
        Ok(factory.make_object_identifier(self.key_index, self.deletion_scope_id, digest))
    }
}

/// Content of an index piece: the ordered children of a large object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub children: Vec<FileIndexChild>,
}

impl FileIndex {
    /// Total size of the content the index expands to.
    pub fn size(&self) -> u64 {
        self.children.iter().map(|c| c.size).sum()
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        let index: Self = bincode::deserialize(data)
            .map_err(|e| StorageError::DataIntegrity(format!("malformed file index: {e}")))?;
        if index.children.is_empty() {
            return Err(StorageError::DataIntegrity("empty file index".to_string()));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_types::ObjectType;

    fn id(factory: &ObjectIdentifierFactory, piece_type: PieceType, byte: u8) -> ObjectIdentifier {
        factory.make_object_identifier(
            0,
            0,
            ObjectDigest::hashed(piece_type, ObjectType::Blob, [byte; 32]),
        )
    }

    #[test]
    fn status_ordering_and_bytes() {
        assert!(ObjectStatus::Transient < ObjectStatus::Local);
        assert!(ObjectStatus::Local < ObjectStatus::Synced);
        for status in [ObjectStatus::Transient, ObjectStatus::Local, ObjectStatus::Synced] {
            assert_eq!(ObjectStatus::from_byte(status.to_byte()).unwrap(), status);
        }
        assert!(ObjectStatus::from_byte(9).is_err());
    }

    #[test]
    fn index_piece_references_skip_inlined_children() {
        let factory = ObjectIdentifierFactory::new();
        let big = id(&factory, PieceType::Chunk, 1);
        let small = factory.make_object_identifier(
            0,
            0,
            ObjectDigest::inlined(PieceType::Chunk, ObjectType::Blob, b"x"),
        );
        let index = FileIndex {
            children: vec![
                FileIndexChild::from_identifier(&big, 5000),
                FileIndexChild::from_identifier(&small, 1),
            ],
        };
        assert_eq!(index.size(), 5001);
        let piece = Piece::new(
            id(&factory, PieceType::Index, 2),
            Bytes::from(index.encode().unwrap()),
        );
        let refs = piece.piece_references().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.get(big.digest()), Some(&KeyPriority::Eager));
    }

    #[test]
    fn chunk_has_no_piece_references() {
        let factory = ObjectIdentifierFactory::new();
        let piece = Piece::new(id(&factory, PieceType::Chunk, 3), Bytes::from_static(b"data"));
        assert!(piece.piece_references().unwrap().is_empty());
    }

    #[test]
    fn malformed_index_is_integrity_error() {
        assert!(matches!(
            FileIndex::decode(b"\xff\xff"),
            Err(StorageError::DataIntegrity(_))
        ));
        let empty = FileIndex::default().encode().unwrap();
        assert!(FileIndex::decode(&empty).is_err());
    }

    #[test]
    fn inlined_piece_carries_its_content() {
        let factory = ObjectIdentifierFactory::new();
        let inlined = factory.make_object_identifier(
            0,
            0,
            ObjectDigest::inlined(PieceType::Chunk, ObjectType::Blob, b"abc"),
        );
        let piece = Piece::from_inlined(&inlined).unwrap();
        assert_eq!(piece.data().as_ref(), b"abc");
        assert!(Piece::from_inlined(&id(&factory, PieceType::Chunk, 1)).is_none());
    }
}
