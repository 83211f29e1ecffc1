//! Immutable commit records.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ledger_crypto::ContentHasher;
use ledger_store::{StorageError, StorageResult};
use ledger_types::{CommitId, ObjectIdentifier, ObjectIdentifierFactory};

/// Nanoseconds since the Unix epoch, saturating at zero for clocks set
/// before it.
pub fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Serialize, Deserialize)]
struct StoredCommit {
    root: Vec<u8>,
    parents: Vec<[u8; 32]>,
    generation: u64,
    timestamp: u64,
}

/// One commit of a page.
///
/// Commits are identified by the hash of their serialized form, except for
/// the first commit which has the reserved [`CommitId::FIRST`].
#[derive(Clone)]
pub struct Commit {
    id: CommitId,
    parent_ids: Vec<CommitId>,
    root_identifier: ObjectIdentifier,
    generation: u64,
    timestamp: u64,
    storage_bytes: Bytes,
}

impl Commit {
    /// The first commit of every page, pointing at the empty tree.
    pub fn first(empty_root: ObjectIdentifier) -> StorageResult<Self> {
        let storage_bytes = encode(&empty_root, &[], 0, 0)?;
        Ok(Self {
            id: CommitId::FIRST,
            parent_ids: Vec::new(),
            root_identifier: empty_root,
            generation: 0,
            timestamp: 0,
            storage_bytes,
        })
    }

    /// A new commit on top of one or two parents.
    ///
    /// A merge takes the latest timestamp of its parents so that identical
    /// merges made on different devices share one id; other commits use
    /// `now`.
    pub fn from_parents(
        root_identifier: ObjectIdentifier,
        parents: &[&Commit],
        now: u64,
    ) -> StorageResult<Self> {
        let mut parent_ids: Vec<CommitId> = parents.iter().map(|p| p.id).collect();
        parent_ids.sort();
        parent_ids.dedup();
        if parent_ids.is_empty() || parent_ids.len() > 2 || parent_ids.len() != parents.len() {
            return Err(StorageError::InvalidArgument(format!(
                "a commit needs one or two distinct parents, got {}",
                parents.len()
            )));
        }
        let generation = parents.iter().map(|p| p.generation).max().unwrap_or(0) + 1;
        let timestamp = if parents.len() == 2 {
            parents.iter().map(|p| p.timestamp).max().unwrap_or(0)
        } else {
            now
        };
        let storage_bytes = encode(&root_identifier, &parent_ids, generation, timestamp)?;
        Ok(Self {
            id: ContentHasher::commit_id(&storage_bytes),
            parent_ids,
            root_identifier,
            generation,
            timestamp,
            storage_bytes,
        })
    }

    /// Parse a stored or downloaded commit.
    ///
    /// Fails with [`StorageError::DataIntegrity`] if the bytes are malformed
    /// or do not hash to `id`.
    pub fn from_storage_bytes(
        factory: &ObjectIdentifierFactory,
        id: CommitId,
        bytes: impl Into<Bytes>,
    ) -> StorageResult<Self> {
        let storage_bytes = bytes.into();
        if !id.is_first() && ContentHasher::commit_id(&storage_bytes) != id {
            return Err(StorageError::DataIntegrity(format!(
                "commit {} does not match its content",
                id.short_hex()
            )));
        }
        let stored: StoredCommit = bincode::deserialize(&storage_bytes)?;
        let parent_ids: Vec<CommitId> = stored.parents.into_iter().map(CommitId::from_hash).collect();
        if parent_ids.len() > 2 || (parent_ids.is_empty() != id.is_first()) {
            return Err(StorageError::DataIntegrity(format!(
                "commit {} has {} parents",
                id.short_hex(),
                parent_ids.len()
            )));
        }
        Ok(Self {
            id,
            parent_ids,
            root_identifier: factory.decode_object_identifier(&stored.root)?,
            generation: stored.generation,
            timestamp: stored.timestamp,
            storage_bytes,
        })
    }

    pub fn id(&self) -> &CommitId {
        &self.id
    }

    /// Parent ids in ascending order.
    pub fn parent_ids(&self) -> &[CommitId] {
        &self.parent_ids
    }

    pub fn root_identifier(&self) -> &ObjectIdentifier {
        &self.root_identifier
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn storage_bytes(&self) -> &Bytes {
        &self.storage_bytes
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() == 2
    }

    /// Sort key used wherever commits need a total, device-independent order.
    pub fn order_key(&self) -> (u64, CommitId) {
        (self.timestamp, self.id)
    }
}

fn encode(
    root: &ObjectIdentifier,
    parents: &[CommitId],
    generation: u64,
    timestamp: u64,
) -> StorageResult<Bytes> {
    let stored = StoredCommit {
        root: root.encode(),
        parents: parents.iter().map(|p| *p.as_bytes()).collect(),
        generation,
        timestamp,
    };
    Ok(Bytes::from(bincode::serialize(&stored)?))
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Commit {}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("parents", &self.parent_ids)
            .field("generation", &self.generation)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}
