//! Merge strategy where the newer head wins every conflict.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use ledger_dag::Commit;
use ledger_page::PageStorage;
use ledger_types::{Entry, ThreeWayChange};

use crate::error::{MergeError, MergeResult};
use crate::strategy::MergeStrategy;

/// Applies the changes `right` made since `base` on top of `left`.
///
/// Keys changed on both sides take the value of the newer head by
/// [`Commit::order_key`], whichever side it is passed as. The result only
/// depends on the three commits, so resolvers on different devices produce
/// the same merge commit.
#[derive(Debug, Default)]
pub struct LastOneWinsMergeStrategy {
    /// Bumped by every cancellation; a merge stops when it changes.
    epoch: AtomicU64,
}

impl LastOneWinsMergeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, started: u64) -> MergeResult<()> {
        if self.epoch.load(Ordering::SeqCst) != started {
            return Err(MergeError::Interrupted);
        }
        Ok(())
    }
}

fn same_value(a: &Option<Entry>, b: &Option<Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_value(b),
        _ => false,
    }
}

#[async_trait]
impl MergeStrategy for LastOneWinsMergeStrategy {
    async fn merge(
        &self,
        storage: &PageStorage,
        left: &Commit,
        right: &Commit,
        base: &Commit,
    ) -> MergeResult<()> {
        let started = self.epoch.load(Ordering::SeqCst);
        let right_wins = right.order_key() > left.order_key();
        let mut journal = storage.start_merge_commit(left.id(), right.id()).await?;
        self.check(started)?;

        let mut changes: Vec<ThreeWayChange> = Vec::new();
        storage
            .get_three_way_contents_diff(base, left, right, "", |change| {
                let right_changed = !same_value(&change.base, &change.right);
                let left_changed = !same_value(&change.base, &change.left);
                if right_changed && (right_wins || !left_changed) {
                    changes.push(change);
                }
                true
            })
            .await?;
        self.check(started)?;

        for change in changes {
            match (change.right, change.base) {
                (Some(entry), _) => {
                    journal.put(entry.key, entry.object_identifier, entry.priority)
                }
                (None, Some(removed)) => journal.delete(removed.key),
                (None, None) => {}
            }
        }
        self.check(started)?;

        let commit = storage.commit_journal(journal).await?;
        debug!(
            left = %left.id().short_hex(),
            right = %right.id().short_hex(),
            merge = ?commit.as_ref().map(|c| c.id().short_hex()),
            "last one wins merge committed"
        );
        Ok(())
    }

    fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use ledger_crypto::KeyedEncryptionService;
    use ledger_page::{PageStorageConfig, PageSyncDelegate, RemotePiece, RetrievedObjectType};
    use ledger_store::{InMemoryDb, ObjectReferences, StorageError, StorageResult};
    use ledger_types::{
        ChangeSource, CommitId, IsObjectSynced, KeyPriority, Location, ObjectIdentifier, ObjectType,
    };

    async fn open() -> Arc<PageStorage> {
        PageStorage::open(
            "page",
            Arc::new(InMemoryDb::new()),
            Arc::new(KeyedEncryptionService::default()),
            PageStorageConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn commit(
        storage: &PageStorage,
        parent: &CommitId,
        puts: &[(&str, &str)],
        deletes: &[&str],
    ) -> Commit {
        let mut journal = storage.start_commit(parent).await.unwrap();
        for (key, value) in puts {
            let id = storage
                .add_object_from_local(
                    ObjectType::Blob,
                    Bytes::copy_from_slice(value.as_bytes()),
                    ObjectReferences::new(),
                )
                .await
                .unwrap();
            journal.put(*key, id, KeyPriority::Eager);
        }
        for key in deletes {
            journal.delete(*key);
        }
        storage.commit_journal(journal).await.unwrap().unwrap()
    }

    async fn value(storage: &PageStorage, commit: &Commit, key: &str) -> Option<Bytes> {
        match storage.get_entry_from_commit(commit, key).await {
            Ok(entry) => Some(
                storage
                    .get_object(&entry.object_identifier, Location::Local)
                    .await
                    .unwrap()
                    .into_data(),
            ),
            Err(StorageError::KeyNotFound(_)) => None,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    async fn single_head(storage: &PageStorage) -> Commit {
        let heads = storage.get_head_commits().await.unwrap();
        assert_eq!(heads.len(), 1);
        heads.into_iter().next().unwrap()
    }

    /// Base with `a` and `b`; the older head rewrites `a` and `b`, the newer
    /// one rewrites `a`, deletes `b` and adds `c`.
    async fn diverged(storage: &PageStorage) -> (Commit, Commit, Commit) {
        let base = commit(storage, &CommitId::FIRST, &[("a", "base"), ("b", "base")], &[]).await;
        let left = commit(storage, base.id(), &[("a", "left"), ("b", "left")], &[]).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let right = commit(storage, base.id(), &[("a", "right"), ("c", "right")], &["b"]).await;
        (base, left, right)
    }

    #[tokio::test]
    async fn newer_head_wins_conflicts() {
        let storage = open().await;
        let (base, left, right) = diverged(&storage).await;
        LastOneWinsMergeStrategy::new()
            .merge(&storage, &left, &right, &base)
            .await
            .unwrap();

        let merged = single_head(&storage).await;
        assert_eq!(merged.parent_ids().len(), 2);
        assert_eq!(value(&storage, &merged, "a").await.unwrap(), "right");
        assert_eq!(value(&storage, &merged, "b").await, None);
        assert_eq!(value(&storage, &merged, "c").await.unwrap(), "right");
    }

    #[tokio::test]
    async fn newer_head_wins_when_passed_first() {
        let storage = open().await;
        let (base, older, newer) = diverged(&storage).await;
        assert!(newer.order_key() > older.order_key());
        LastOneWinsMergeStrategy::new()
            .merge(&storage, &newer, &older, &base)
            .await
            .unwrap();

        let merged = single_head(&storage).await;
        assert_eq!(value(&storage, &merged, "a").await.unwrap(), "right");
        assert_eq!(value(&storage, &merged, "b").await, None);
        assert_eq!(value(&storage, &merged, "c").await.unwrap(), "right");
    }

    #[tokio::test]
    async fn one_sided_changes_are_kept() {
        let storage = open().await;
        let base = commit(&storage, &CommitId::FIRST, &[("a", "base")], &[]).await;
        let left = commit(&storage, base.id(), &[("l", "left")], &[]).await;
        let right = commit(&storage, base.id(), &[("r", "right")], &[]).await;
        LastOneWinsMergeStrategy::new()
            .merge(&storage, &left, &right, &base)
            .await
            .unwrap();

        let merged = single_head(&storage).await;
        assert_eq!(value(&storage, &merged, "a").await.unwrap(), "base");
        assert_eq!(value(&storage, &merged, "l").await.unwrap(), "left");
        assert_eq!(value(&storage, &merged, "r").await.unwrap(), "right");
    }

    /// Serves another storage's pieces, as a peer would.
    struct Peer(Arc<PageStorage>);

    #[async_trait]
    impl PageSyncDelegate for Peer {
        async fn get_object(
            &self,
            identifier: &ObjectIdentifier,
            _retrieved_type: RetrievedObjectType,
        ) -> StorageResult<RemotePiece> {
            let piece = self.0.get_piece(identifier).await?;
            Ok(RemotePiece {
                source: ChangeSource::P2p,
                is_synced: IsObjectSynced::No,
                data: piece.data().clone(),
            })
        }
    }

    #[tokio::test]
    async fn independent_merges_converge() {
        let origin = open().await;
        let (base, left, right) = diverged(&origin).await;

        let replica = open().await;
        let peer: Arc<dyn PageSyncDelegate> = Arc::new(Peer(origin.clone()));
        replica.set_sync_delegate(&peer);
        replica
            .add_commits_from_sync(
                [&base, &left, &right]
                    .iter()
                    .map(|c| (*c.id(), c.storage_bytes().clone()))
                    .collect(),
                ChangeSource::P2p,
            )
            .await
            .unwrap();

        let mut merges = Vec::new();
        for storage in [&origin, &replica] {
            let base = storage.get_commit(base.id()).await.unwrap();
            let left = storage.get_commit(left.id()).await.unwrap();
            let right = storage.get_commit(right.id()).await.unwrap();
            LastOneWinsMergeStrategy::new()
                .merge(storage, &left, &right, &base)
                .await
                .unwrap();
            merges.push(*single_head(storage).await.id());
        }
        assert_eq!(merges[0], merges[1]);
    }
}
