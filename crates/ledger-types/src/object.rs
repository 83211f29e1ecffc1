use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Size of a hashed (non-inline) digest payload. Content at most this long is
/// inlined into its digest instead of being stored as a piece.
pub const STORAGE_HASH_SIZE: usize = 32;

const INLINE_BIT: u8 = 0b001;
const BLOB_BIT: u8 = 0b010;
const INDEX_BIT: u8 = 0b100;

/// Kind of a full object, as seen by the B-tree layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    /// A serialized B-tree node.
    TreeNode,
    /// An opaque value.
    Blob,
}

/// Kind of a single piece of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PieceType {
    /// Raw content bytes.
    Chunk,
    /// A file index listing child pieces.
    Index,
}

/// Decoded type tag of an [`ObjectDigest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectDigestInfo {
    pub piece_type: PieceType,
    pub object_type: ObjectType,
    pub inlined: bool,
}

impl ObjectDigestInfo {
    /// Whether the piece is a chunk (directly holds content).
    pub fn is_chunk(&self) -> bool {
        self.piece_type == PieceType::Chunk
    }

    fn tag(&self) -> u8 {
        let mut tag = 0;
        if self.inlined {
            tag |= INLINE_BIT;
        }
        if self.object_type == ObjectType::Blob {
            tag |= BLOB_BIT;
        }
        if self.piece_type == PieceType::Index {
            tag |= INDEX_BIT;
        }
        tag
    }

    fn from_tag(tag: u8) -> Result<Self, TypeError> {
        if tag & !(INLINE_BIT | BLOB_BIT | INDEX_BIT) != 0 {
            return Err(TypeError::InvalidDigest(format!("unknown tag bits {tag:#04x}")));
        }
        Ok(Self {
            piece_type: if tag & INDEX_BIT != 0 {
                PieceType::Index
            } else {
                PieceType::Chunk
            },
            object_type: if tag & BLOB_BIT != 0 {
                ObjectType::Blob
            } else {
                ObjectType::TreeNode
            },
            inlined: tag & INLINE_BIT != 0,
        })
    }
}

/// Type-tagged digest of a piece.
///
/// The first byte encodes the piece type, object type and whether the digest
/// is inlined. An inlined digest carries the content itself; otherwise the
/// remaining 32 bytes are a domain-separated BLAKE3 hash of the content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectDigest(Vec<u8>);

impl ObjectDigest {
    /// Build a digest that inlines `content`.
    pub fn inlined(piece_type: PieceType, object_type: ObjectType, content: &[u8]) -> Self {
        debug_assert!(content.len() <= STORAGE_HASH_SIZE);
        let info = ObjectDigestInfo {
            piece_type,
            object_type,
            inlined: true,
        };
        let mut bytes = Vec::with_capacity(content.len() + 1);
        bytes.push(info.tag());
        bytes.extend_from_slice(content);
        Self(bytes)
    }

    /// Build a digest from a pre-computed content hash.
    pub fn hashed(piece_type: PieceType, object_type: ObjectType, hash: [u8; 32]) -> Self {
        let info = ObjectDigestInfo {
            piece_type,
            object_type,
            inlined: false,
        };
        let mut bytes = Vec::with_capacity(STORAGE_HASH_SIZE + 1);
        bytes.push(info.tag());
        bytes.extend_from_slice(&hash);
        Self(bytes)
    }

    /// Parse and validate an encoded digest.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, TypeError> {
        let Some(&tag) = bytes.first() else {
            return Err(TypeError::InvalidDigest("empty digest".to_string()));
        };
        let info = ObjectDigestInfo::from_tag(tag)?;
        let payload = bytes.len() - 1;
        if info.inlined && payload > STORAGE_HASH_SIZE {
            return Err(TypeError::InvalidDigest(format!(
                "inlined content of {payload} bytes"
            )));
        }
        if !info.inlined && payload != STORAGE_HASH_SIZE {
            return Err(TypeError::InvalidLength {
                expected: STORAGE_HASH_SIZE + 1,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    /// Decoded type tag.
    pub fn info(&self) -> ObjectDigestInfo {
        // Construction always goes through a validated path.
        ObjectDigestInfo::from_tag(self.0[0]).unwrap_or(ObjectDigestInfo {
            piece_type: PieceType::Chunk,
            object_type: ObjectType::Blob,
            inlined: false,
        })
    }

    /// Whether the content is carried by the digest itself.
    pub fn is_inlined(&self) -> bool {
        self.0[0] & INLINE_BIT != 0
    }

    /// The inlined content, if any.
    pub fn inlined_data(&self) -> Option<&[u8]> {
        self.is_inlined().then(|| &self.0[1..])
    }

    /// The full encoded digest.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex-encoded representation, used as a storage row key.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short hex representation of the digest payload.
    pub fn short_hex(&self) -> String {
        let end = self.0.len().min(5);
        hex::encode(&self.0[1..end])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_inlined() {
            write!(f, "ObjectDigest(inline:{})", hex::encode(&self.0[1..]))
        } else {
            write!(f, "ObjectDigest({})", self.short_hex())
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Liveness handle shared by every identifier of one digest.
#[derive(Debug)]
struct IdentifierToken {
    factory_id: u64,
}

#[derive(Serialize, Deserialize)]
struct EncodedIdentifier {
    key_index: u32,
    deletion_scope_id: u32,
    digest: Vec<u8>,
}

/// Identifier of an object: its digest plus the key index and deletion scope
/// the encryption layer uses to derive cloud-visible names.
///
/// Identifiers are minted by an [`ObjectIdentifierFactory`] and are only valid
/// for the factory that minted them. While any identifier of a digest is
/// alive, the factory reports that digest as live and garbage collection
/// keeps the object.
#[derive(Clone)]
pub struct ObjectIdentifier {
    key_index: u32,
    deletion_scope_id: u32,
    digest: ObjectDigest,
    token: Arc<IdentifierToken>,
}

impl ObjectIdentifier {
    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn deletion_scope_id(&self) -> u32 {
        self.deletion_scope_id
    }

    pub fn digest(&self) -> &ObjectDigest {
        &self.digest
    }

    /// Id of the factory that minted this identifier.
    pub fn factory_id(&self) -> u64 {
        self.token.factory_id
    }

    /// Serialize for embedding in tree nodes, commits and file indexes.
    pub fn encode(&self) -> Vec<u8> {
        let encoded = EncodedIdentifier {
            key_index: self.key_index,
            deletion_scope_id: self.deletion_scope_id,
            digest: self.digest.as_bytes().to_vec(),
        };
        // Serializing plain integers and bytes into a Vec cannot fail.
        bincode::serialize(&encoded).unwrap_or_default()
    }
}

impl PartialEq for ObjectIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key_index == other.key_index
            && self.deletion_scope_id == other.deletion_scope_id
            && self.digest == other.digest
    }
}

impl Eq for ObjectIdentifier {}

impl Hash for ObjectIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_index.hash(state);
        self.deletion_scope_id.hash(state);
        self.digest.hash(state);
    }
}

impl PartialOrd for ObjectIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectIdentifier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.digest, self.key_index, self.deletion_scope_id).cmp(&(
            &other.digest,
            other.key_index,
            other.deletion_scope_id,
        ))
    }
}

impl fmt::Debug for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectIdentifier({:?}, key_index={}, scope={})",
            self.digest, self.key_index, self.deletion_scope_id
        )
    }
}

/// Mints [`ObjectIdentifier`]s and tracks which digests still have live
/// identifiers.
pub struct ObjectIdentifierFactory {
    id: u64,
    live: Mutex<HashMap<ObjectDigest, Weak<IdentifierToken>>>,
}

impl ObjectIdentifierFactory {
    pub fn new() -> Self {
        Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Unique id of this factory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Create an identifier for `digest`, sharing the liveness token with any
    /// identifier of the same digest that is still alive.
    pub fn make_object_identifier(
        &self,
        key_index: u32,
        deletion_scope_id: u32,
        digest: ObjectDigest,
    ) -> ObjectIdentifier {
        let mut live = self.live.lock().expect("lock poisoned");
        let token = match live.get(&digest).and_then(Weak::upgrade) {
            Some(token) => token,
            None => {
                let token = Arc::new(IdentifierToken {
                    factory_id: self.id,
                });
                live.insert(digest.clone(), Arc::downgrade(&token));
                token
            }
        };
        ObjectIdentifier {
            key_index,
            deletion_scope_id,
            digest,
            token,
        }
    }

    /// Decode an identifier produced by [`ObjectIdentifier::encode`].
    pub fn decode_object_identifier(&self, bytes: &[u8]) -> Result<ObjectIdentifier, TypeError> {
        let encoded: EncodedIdentifier =
            bincode::deserialize(bytes).map_err(|e| TypeError::Serialization(e.to_string()))?;
        let digest = ObjectDigest::from_bytes(encoded.digest)?;
        Ok(self.make_object_identifier(encoded.key_index, encoded.deletion_scope_id, digest))
    }

    /// Whether an identifier of `digest` minted here is still alive.
    pub fn is_live(&self, digest: &ObjectDigest) -> bool {
        self.live
            .lock()
            .expect("lock poisoned")
            .get(digest)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Number of digests with live identifiers. Drops stale tracking entries.
    pub fn live_count(&self) -> usize {
        let mut live = self.live.lock().expect("lock poisoned");
        live.retain(|_, weak| weak.strong_count() > 0);
        live.len()
    }
}

impl Default for ObjectIdentifierFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectIdentifierFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectIdentifierFactory")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashed(byte: u8) -> ObjectDigest {
        ObjectDigest::hashed(PieceType::Chunk, ObjectType::Blob, [byte; 32])
    }

    #[test]
    fn digest_info_roundtrips_through_tag() {
        for piece_type in [PieceType::Chunk, PieceType::Index] {
            for object_type in [ObjectType::TreeNode, ObjectType::Blob] {
                let digest = ObjectDigest::hashed(piece_type, object_type, [7; 32]);
                let info = digest.info();
                assert_eq!(info.piece_type, piece_type);
                assert_eq!(info.object_type, object_type);
                assert!(!info.inlined);
            }
        }
    }

    #[test]
    fn inlined_digest_carries_content() {
        let digest = ObjectDigest::inlined(PieceType::Chunk, ObjectType::Blob, b"small");
        assert!(digest.is_inlined());
        assert_eq!(digest.inlined_data(), Some(&b"small"[..]));
        assert_eq!(hashed(1).inlined_data(), None);
    }

    #[test]
    fn from_bytes_validates_length() {
        assert!(ObjectDigest::from_bytes(vec![]).is_err());
        assert!(ObjectDigest::from_bytes(vec![0, 1, 2]).is_err());
        assert!(ObjectDigest::from_bytes(vec![INLINE_BIT; 40]).is_err());
        assert!(ObjectDigest::from_bytes(vec![0xf0; 33]).is_err());
        let digest = hashed(3);
        assert_eq!(
            ObjectDigest::from_bytes(digest.as_bytes().to_vec()).unwrap(),
            digest
        );
    }

    #[test]
    fn hex_roundtrip() {
        let digest = hashed(9);
        assert_eq!(ObjectDigest::from_hex(&digest.to_hex()).unwrap(), digest);
    }

    #[test]
    fn identifier_equality_ignores_factory() {
        let f1 = ObjectIdentifierFactory::new();
        let f2 = ObjectIdentifierFactory::new();
        let a = f1.make_object_identifier(1, 2, hashed(1));
        let b = f2.make_object_identifier(1, 2, hashed(1));
        assert_eq!(a, b);
        assert_ne!(a.factory_id(), b.factory_id());
        assert_ne!(a, f1.make_object_identifier(1, 3, hashed(1)));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let factory = ObjectIdentifierFactory::new();
        let id = factory.make_object_identifier(4, 5, hashed(2));
        let decoded = factory.decode_object_identifier(&id.encode()).unwrap();
        assert_eq!(id, decoded);
        assert_eq!(decoded.key_index(), 4);
        assert_eq!(decoded.deletion_scope_id(), 5);
    }

    #[test]
    fn liveness_follows_identifier_lifetime() {
        let factory = ObjectIdentifierFactory::new();
        let digest = hashed(5);
        assert!(!factory.is_live(&digest));
        let id = factory.make_object_identifier(0, 0, digest.clone());
        let copy = id.clone();
        assert!(factory.is_live(&digest));
        drop(id);
        assert!(factory.is_live(&digest));
        drop(copy);
        assert!(!factory.is_live(&digest));
        assert_eq!(factory.live_count(), 0);
    }
}
