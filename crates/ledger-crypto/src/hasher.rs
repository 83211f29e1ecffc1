use ledger_types::{CommitId, ObjectDigest, ObjectType, PieceType, STORAGE_HASH_SIZE};

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag (e.g., `"ledger-chunk-blob-v1"`) that is
/// prepended to every hash computation. A chunk and an index piece with
/// identical bytes therefore produce different digests.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for chunk pieces of tree nodes.
    pub const CHUNK_TREE_NODE: Self = Self {
        domain: "ledger-chunk-tree-v1",
    };
    /// Hasher for chunk pieces of values.
    pub const CHUNK_BLOB: Self = Self {
        domain: "ledger-chunk-blob-v1",
    };
    /// Hasher for index pieces of tree nodes.
    pub const INDEX_TREE_NODE: Self = Self {
        domain: "ledger-index-tree-v1",
    };
    /// Hasher for index pieces of values.
    pub const INDEX_BLOB: Self = Self {
        domain: "ledger-index-blob-v1",
    };
    /// Hasher for serialized commits.
    pub const COMMIT: Self = Self {
        domain: "ledger-commit-v1",
    };
    /// Hasher for B-tree key levels.
    pub const NODE_LEVEL: Self = Self {
        domain: "ledger-node-level-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// The hasher for a piece of the given types.
    pub const fn for_piece(piece_type: PieceType, object_type: ObjectType) -> Self {
        match (piece_type, object_type) {
            (PieceType::Chunk, ObjectType::TreeNode) => Self::CHUNK_TREE_NODE,
            (PieceType::Chunk, ObjectType::Blob) => Self::CHUNK_BLOB,
            (PieceType::Index, ObjectType::TreeNode) => Self::INDEX_TREE_NODE,
            (PieceType::Index, ObjectType::Blob) => Self::INDEX_BLOB,
        }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }

    /// Verify that data produces the expected hash.
    pub fn verify(&self, data: &[u8], expected: &[u8; 32]) -> bool {
        self.hash(data) == *expected
    }

    /// The id of a commit with the given serialized form.
    pub fn commit_id(data: &[u8]) -> CommitId {
        CommitId::from_hash(Self::COMMIT.hash(data))
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

/// Compute the digest of a piece.
///
/// Content of at most [`STORAGE_HASH_SIZE`] bytes is inlined into the digest;
/// larger content is hashed with the domain of its piece and object type.
pub fn compute_object_digest(
    piece_type: PieceType,
    object_type: ObjectType,
    content: &[u8],
) -> ObjectDigest {
    if content.len() <= STORAGE_HASH_SIZE {
        return ObjectDigest::inlined(piece_type, object_type, content);
    }
    let hash = ContentHasher::for_piece(piece_type, object_type).hash(content);
    ObjectDigest::hashed(piece_type, object_type, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"hello world";
        assert_eq!(
            ContentHasher::CHUNK_BLOB.hash(data),
            ContentHasher::CHUNK_BLOB.hash(data)
        );
    }

    #[test]
    fn different_domains_produce_different_hashes() {
        let data = b"same content";
        let chunk = ContentHasher::CHUNK_BLOB.hash(data);
        let index = ContentHasher::INDEX_BLOB.hash(data);
        let commit = ContentHasher::COMMIT.hash(data);
        assert_ne!(chunk, index);
        assert_ne!(chunk, commit);
    }

    #[test]
    fn verify_detects_tampering() {
        let hash = ContentHasher::COMMIT.hash(b"original");
        assert!(ContentHasher::COMMIT.verify(b"original", &hash));
        assert!(!ContentHasher::COMMIT.verify(b"tampered", &hash));
    }

    #[test]
    fn small_content_is_inlined() {
        let digest = compute_object_digest(PieceType::Chunk, ObjectType::Blob, b"tiny");
        assert!(digest.is_inlined());
        assert_eq!(digest.inlined_data(), Some(&b"tiny"[..]));

        let boundary = [7u8; STORAGE_HASH_SIZE];
        assert!(compute_object_digest(PieceType::Chunk, ObjectType::Blob, &boundary).is_inlined());
    }

    #[test]
    fn large_content_is_hashed_per_type() {
        let data = vec![1u8; 100];
        let blob = compute_object_digest(PieceType::Chunk, ObjectType::Blob, &data);
        let node = compute_object_digest(PieceType::Chunk, ObjectType::TreeNode, &data);
        assert!(!blob.is_inlined());
        assert_ne!(blob, node);
        assert_eq!(node.info().object_type, ObjectType::TreeNode);
    }

    #[test]
    fn commit_id_is_domain_separated() {
        let id = ContentHasher::commit_id(b"commit");
        assert_eq!(id.as_bytes(), &ContentHasher::COMMIT.hash(b"commit"));
        assert!(!id.is_first());
    }
}
