//! Typed rows of one page on top of a [`Db`].
//!
//! Row layout (commit ids are raw bytes, digests are hex):
//!
//! ```text
//! heads/<commit>                      -> timestamp (u64 BE)
//! commits/<commit>                    -> serialized commit
//! merges/<parent1><parent2><merge>    -> ""
//! unsynced_commits/<commit>           -> generation (u64 BE)
//! objects/<digest>                    -> piece content
//! status/<digest>                     -> ObjectStatus byte
//! objrefs/<digest>                    -> outgoing references
//! refs/<target>/o/<source digest>     -> "" (object to object)
//! refs/<target>/c/<source commit>     -> "" (commit to root)
//! sync_metadata/<key>                 -> value
//! page_online                         -> ""
//! ```

use std::sync::Arc;

use ledger_types::{CommitId, KeyPriority, ObjectDigest};

use crate::db::{Batch, Db};
use crate::error::{StorageError, StorageResult};
use crate::object::{ObjectReferences, ObjectStatus};

const HEADS: &[u8] = b"heads/";
const COMMITS: &[u8] = b"commits/";
const MERGES: &[u8] = b"merges/";
const UNSYNCED_COMMITS: &[u8] = b"unsynced_commits/";
const OBJECTS: &[u8] = b"objects/";
const STATUS: &[u8] = b"status/";
const OBJECT_REFS: &[u8] = b"objrefs/";
const REFS: &[u8] = b"refs/";
const SYNC_METADATA: &[u8] = b"sync_metadata/";
const PAGE_ONLINE: &[u8] = b"page_online";

fn key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn digest_key(prefix: &[u8], digest: &ObjectDigest) -> Vec<u8> {
    key(prefix, digest.to_hex().as_bytes())
}

fn inbound_prefix(target: &ObjectDigest) -> Vec<u8> {
    let mut k = digest_key(REFS, target);
    k.push(b'/');
    k
}

fn object_ref_key(target: &ObjectDigest, source: &ObjectDigest) -> Vec<u8> {
    let mut k = inbound_prefix(target);
    k.extend_from_slice(b"o/");
    k.extend_from_slice(source.to_hex().as_bytes());
    k
}

fn commit_ref_key(target: &ObjectDigest, source: &CommitId) -> Vec<u8> {
    let mut k = inbound_prefix(target);
    k.extend_from_slice(b"c/");
    k.extend_from_slice(source.to_hex().as_bytes());
    k
}

fn decode_u64(bytes: &[u8]) -> StorageResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::DataIntegrity(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn commit_suffix(row_key: &[u8], prefix: &[u8]) -> StorageResult<CommitId> {
    Ok(CommitId::from_slice(&row_key[prefix.len()..])?)
}

/// Typed access to the rows of one page.
#[derive(Clone)]
pub struct PageDb {
    db: Arc<dyn Db>,
}

impl PageDb {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db }
    }

    /// Start a batch of row writes.
    pub fn start_batch(&self) -> PageDbBatch {
        PageDbBatch::default()
    }

    /// Apply a batch atomically.
    pub async fn execute(&self, batch: PageDbBatch) -> StorageResult<()> {
        self.db.execute(batch.batch).await
    }

    // -----------------------------------------------------------------
    // Heads and commits
    // -----------------------------------------------------------------

    /// Every head with its timestamp, in commit id order.
    pub async fn get_heads(&self) -> StorageResult<Vec<(CommitId, u64)>> {
        let rows = self.db.scan_prefix(HEADS).await?;
        rows.iter()
            .map(|(k, v)| Ok((commit_suffix(k, HEADS)?, decode_u64(v)?)))
            .collect()
    }

    pub async fn is_head(&self, id: &CommitId) -> StorageResult<bool> {
        self.db.has_key(&key(HEADS, id.as_bytes())).await
    }

    pub async fn get_commit_storage_bytes(&self, id: &CommitId) -> StorageResult<Vec<u8>> {
        self.db
            .get(&key(COMMITS, id.as_bytes()))
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("commit {}", id.short_hex())))
    }

    pub async fn has_commit(&self, id: &CommitId) -> StorageResult<bool> {
        self.db.has_key(&key(COMMITS, id.as_bytes())).await
    }

    /// Ids of every stored commit.
    pub async fn get_commit_ids(&self) -> StorageResult<Vec<CommitId>> {
        let rows = self.db.scan_prefix(COMMITS).await?;
        rows.iter().map(|(k, _)| commit_suffix(k, COMMITS)).collect()
    }

    /// Merge commits whose parents are exactly `parent1` and `parent2`, in
    /// that order.
    pub async fn get_merges(
        &self,
        parent1: &CommitId,
        parent2: &CommitId,
    ) -> StorageResult<Vec<CommitId>> {
        let mut prefix = key(MERGES, parent1.as_bytes());
        prefix.extend_from_slice(parent2.as_bytes());
        let rows = self.db.scan_prefix(&prefix).await?;
        rows.iter().map(|(k, _)| commit_suffix(k, &prefix)).collect()
    }

    /// Unsynced commits with their generations.
    pub async fn get_unsynced_commit_ids(&self) -> StorageResult<Vec<(CommitId, u64)>> {
        let rows = self.db.scan_prefix(UNSYNCED_COMMITS).await?;
        rows.iter()
            .map(|(k, v)| Ok((commit_suffix(k, UNSYNCED_COMMITS)?, decode_u64(v)?)))
            .collect()
    }

    pub async fn is_commit_synced(&self, id: &CommitId) -> StorageResult<bool> {
        Ok(!self.db.has_key(&key(UNSYNCED_COMMITS, id.as_bytes())).await?)
    }

    // -----------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------

    pub async fn read_piece(&self, digest: &ObjectDigest) -> StorageResult<Option<Vec<u8>>> {
        self.db.get(&digest_key(OBJECTS, digest)).await
    }

    pub async fn has_piece(&self, digest: &ObjectDigest) -> StorageResult<bool> {
        self.db.has_key(&digest_key(OBJECTS, digest)).await
    }

    pub async fn get_object_status(
        &self,
        digest: &ObjectDigest,
    ) -> StorageResult<Option<ObjectStatus>> {
        match self.db.get(&digest_key(STATUS, digest)).await? {
            Some(v) if v.len() == 1 => Ok(Some(ObjectStatus::from_byte(v[0])?)),
            Some(v) => Err(StorageError::DataIntegrity(format!(
                "status row of {} bytes",
                v.len()
            ))),
            None => Ok(None),
        }
    }

    /// Outgoing references of a stored piece.
    pub async fn get_references(&self, digest: &ObjectDigest) -> StorageResult<ObjectReferences> {
        let Some(raw) = self.db.get(&digest_key(OBJECT_REFS, digest)).await? else {
            return Ok(ObjectReferences::new());
        };
        let decoded: Vec<(Vec<u8>, KeyPriority)> = bincode::deserialize(&raw)?;
        decoded
            .into_iter()
            .map(|(d, p)| Ok((ObjectDigest::from_bytes(d)?, p)))
            .collect()
    }

    /// Whether any object or commit still references `digest`.
    pub async fn has_inbound_references(&self, digest: &ObjectDigest) -> StorageResult<bool> {
        Ok(!self.db.scan_prefix(&inbound_prefix(digest)).await?.is_empty())
    }

    /// Digests of pieces that are committed locally but not yet synced.
    pub async fn get_unsynced_pieces(&self) -> StorageResult<Vec<ObjectDigest>> {
        let rows = self.db.scan_prefix(STATUS).await?;
        let mut digests = Vec::new();
        for (k, v) in rows {
            if v.first().copied() == Some(ObjectStatus::Local.to_byte()) {
                let hex = std::str::from_utf8(&k[STATUS.len()..])
                    .map_err(|e| StorageError::DataIntegrity(e.to_string()))?;
                digests.push(ObjectDigest::from_hex(hex)?);
            }
        }
        Ok(digests)
    }

    // -----------------------------------------------------------------
    // Sync metadata
    // -----------------------------------------------------------------

    pub async fn get_sync_metadata(&self, key_name: &str) -> StorageResult<Option<Vec<u8>>> {
        self.db.get(&key(SYNC_METADATA, key_name.as_bytes())).await
    }

    pub async fn is_page_online(&self) -> StorageResult<bool> {
        self.db.has_key(PAGE_ONLINE).await
    }
}

impl std::fmt::Debug for PageDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDb").finish_non_exhaustive()
    }
}

/// Row writes for one atomic [`PageDb::execute`].
#[derive(Debug, Default)]
pub struct PageDbBatch {
    batch: Batch,
}

impl PageDbBatch {
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn add_head(&mut self, id: &CommitId, timestamp: u64) {
        self.batch
            .put(key(HEADS, id.as_bytes()), timestamp.to_be_bytes().to_vec());
    }

    pub fn remove_head(&mut self, id: &CommitId) {
        self.batch.delete(key(HEADS, id.as_bytes()));
    }

    /// Store a commit and the reference it holds on its root node.
    pub fn add_commit_storage_bytes(&mut self, id: &CommitId, root: &ObjectDigest, bytes: &[u8]) {
        self.batch.put(key(COMMITS, id.as_bytes()), bytes.to_vec());
        if !root.is_inlined() {
            self.batch.put(commit_ref_key(root, id), Vec::new());
        }
    }

    pub fn delete_commit(&mut self, id: &CommitId, root: &ObjectDigest) {
        self.batch.delete(key(COMMITS, id.as_bytes()));
        self.batch.delete(key(UNSYNCED_COMMITS, id.as_bytes()));
        self.batch.delete(key(HEADS, id.as_bytes()));
        self.batch.delete(commit_ref_key(root, id));
    }

    pub fn add_merge(&mut self, parent1: &CommitId, parent2: &CommitId, merge: &CommitId) {
        self.batch.put(merge_key(parent1, parent2, merge), Vec::new());
    }

    pub fn delete_merge(&mut self, parent1: &CommitId, parent2: &CommitId, merge: &CommitId) {
        self.batch.delete(merge_key(parent1, parent2, merge));
    }

    pub fn mark_commit_unsynced(&mut self, id: &CommitId, generation: u64) {
        self.batch.put(
            key(UNSYNCED_COMMITS, id.as_bytes()),
            generation.to_be_bytes().to_vec(),
        );
    }

    pub fn mark_commit_synced(&mut self, id: &CommitId) {
        self.batch.delete(key(UNSYNCED_COMMITS, id.as_bytes()));
    }

    /// Store a piece with its status and outgoing references.
    pub fn write_piece(
        &mut self,
        digest: &ObjectDigest,
        data: &[u8],
        status: ObjectStatus,
        references: &ObjectReferences,
    ) -> StorageResult<()> {
        self.batch.put(digest_key(OBJECTS, digest), data.to_vec());
        self.set_object_status(digest, status);
        if !references.is_empty() {
            let encoded: Vec<(Vec<u8>, KeyPriority)> = references
                .iter()
                .map(|(d, p)| (d.as_bytes().to_vec(), *p))
                .collect();
            self.batch
                .put(digest_key(OBJECT_REFS, digest), bincode::serialize(&encoded)?);
            for target in references.keys() {
                self.batch.put(object_ref_key(target, digest), Vec::new());
            }
        }
        Ok(())
    }

    pub fn set_object_status(&mut self, digest: &ObjectDigest, status: ObjectStatus) {
        self.batch
            .put(digest_key(STATUS, digest), vec![status.to_byte()]);
    }

    /// Remove a piece and the references it holds.
    pub fn delete_piece(&mut self, digest: &ObjectDigest, references: &ObjectReferences) {
        self.batch.delete(digest_key(OBJECTS, digest));
        self.batch.delete(digest_key(STATUS, digest));
        self.batch.delete(digest_key(OBJECT_REFS, digest));
        for target in references.keys() {
            self.batch.delete(object_ref_key(target, digest));
        }
    }

    pub fn set_sync_metadata(&mut self, key_name: &str, value: &[u8]) {
        self.batch
            .put(key(SYNC_METADATA, key_name.as_bytes()), value.to_vec());
    }

    pub fn mark_page_online(&mut self) {
        self.batch.put(PAGE_ONLINE.to_vec(), Vec::new());
    }
}

fn merge_key(parent1: &CommitId, parent2: &CommitId, merge: &CommitId) -> Vec<u8> {
    let mut k = key(MERGES, parent1.as_bytes());
    k.extend_from_slice(parent2.as_bytes());
    k.extend_from_slice(merge.as_bytes());
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDb;
    use ledger_types::{ObjectType, PieceType};

    fn page_db() -> PageDb {
        PageDb::new(Arc::new(InMemoryDb::new()))
    }

    fn commit(byte: u8) -> CommitId {
        CommitId::from_hash([byte; 32])
    }

    fn digest(byte: u8) -> ObjectDigest {
        ObjectDigest::hashed(PieceType::Chunk, ObjectType::Blob, [byte; 32])
    }

    #[tokio::test]
    async fn heads_roundtrip() {
        let db = page_db();
        let mut batch = db.start_batch();
        batch.add_head(&commit(2), 20);
        batch.add_head(&commit(1), 10);
        db.execute(batch).await.unwrap();
        assert_eq!(
            db.get_heads().await.unwrap(),
            vec![(commit(1), 10), (commit(2), 20)]
        );

        let mut batch = db.start_batch();
        batch.remove_head(&commit(1));
        db.execute(batch).await.unwrap();
        assert!(!db.is_head(&commit(1)).await.unwrap());
        assert!(db.is_head(&commit(2)).await.unwrap());
    }

    #[tokio::test]
    async fn commits_and_merges() {
        let db = page_db();
        let mut batch = db.start_batch();
        batch.add_commit_storage_bytes(&commit(3), &digest(9), b"bytes");
        batch.add_merge(&commit(1), &commit(2), &commit(3));
        batch.mark_commit_unsynced(&commit(3), 4);
        db.execute(batch).await.unwrap();

        assert_eq!(db.get_commit_storage_bytes(&commit(3)).await.unwrap(), b"bytes");
        assert!(matches!(
            db.get_commit_storage_bytes(&commit(4)).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(db.get_merges(&commit(1), &commit(2)).await.unwrap(), vec![commit(3)]);
        assert!(db.get_merges(&commit(2), &commit(1)).await.unwrap().is_empty());
        assert_eq!(db.get_unsynced_commit_ids().await.unwrap(), vec![(commit(3), 4)]);
        assert!(db.has_inbound_references(&digest(9)).await.unwrap());

        let mut batch = db.start_batch();
        batch.delete_commit(&commit(3), &digest(9));
        batch.delete_merge(&commit(1), &commit(2), &commit(3));
        db.execute(batch).await.unwrap();
        assert!(!db.has_commit(&commit(3)).await.unwrap());
        assert!(db.is_commit_synced(&commit(3)).await.unwrap());
        assert!(!db.has_inbound_references(&digest(9)).await.unwrap());
        assert!(db.get_merges(&commit(1), &commit(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pieces_status_and_references() {
        let db = page_db();
        let mut refs = ObjectReferences::new();
        refs.insert(digest(2), KeyPriority::Lazy);
        let mut batch = db.start_batch();
        batch
            .write_piece(&digest(1), b"parent", ObjectStatus::Local, &refs)
            .unwrap();
        batch
            .write_piece(&digest(2), b"child", ObjectStatus::Synced, &ObjectReferences::new())
            .unwrap();
        db.execute(batch).await.unwrap();

        assert_eq!(db.read_piece(&digest(1)).await.unwrap(), Some(b"parent".to_vec()));
        assert_eq!(
            db.get_object_status(&digest(2)).await.unwrap(),
            Some(ObjectStatus::Synced)
        );
        assert_eq!(db.get_references(&digest(1)).await.unwrap(), refs);
        assert!(db.has_inbound_references(&digest(2)).await.unwrap());
        assert_eq!(db.get_unsynced_pieces().await.unwrap(), vec![digest(1)]);

        let mut batch = db.start_batch();
        batch.delete_piece(&digest(1), &refs);
        db.execute(batch).await.unwrap();
        assert!(!db.has_piece(&digest(1)).await.unwrap());
        assert!(!db.has_inbound_references(&digest(2)).await.unwrap());
        assert!(db.get_unsynced_pieces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_metadata_and_online_flag() {
        let db = page_db();
        assert_eq!(db.get_sync_metadata("timestamp").await.unwrap(), None);
        assert!(!db.is_page_online().await.unwrap());
        let mut batch = db.start_batch();
        batch.set_sync_metadata("timestamp", b"43");
        batch.mark_page_online();
        db.execute(batch).await.unwrap();
        assert_eq!(
            db.get_sync_metadata("timestamp").await.unwrap(),
            Some(b"43".to_vec())
        );
        assert!(db.is_page_online().await.unwrap());
    }
}
