use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::debug;

use ledger_page::PageStorage;
use ledger_types::ObjectIdentifier;

use crate::cloud::{CloudCommit, PageCloud};
use crate::error::{SyncError, SyncResult};

/// Uploads everything a page has not synced yet.
///
/// Pieces go first, at most `concurrency` at a time, so that a commit never
/// reaches the cloud before the objects it references. Each piece and commit
/// is marked synced only after the cloud accepted it.
pub struct BatchUpload {
    storage: Arc<PageStorage>,
    cloud: Arc<dyn PageCloud>,
    concurrency: usize,
}

impl BatchUpload {
    pub fn new(storage: Arc<PageStorage>, cloud: Arc<dyn PageCloud>, concurrency: usize) -> Self {
        Self {
            storage,
            cloud,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload unsynced pieces, then unsynced commits. Returns the number of
    /// commits uploaded.
    pub async fn start(&self) -> SyncResult<usize> {
        let pieces = self.storage.get_unsynced_pieces().await?;
        let piece_count = pieces.len();
        self.upload_pieces(pieces).await?;

        let commits = self.storage.get_unsynced_commits().await?;
        if commits.is_empty() {
            return Ok(0);
        }
        let encryption = self.storage.encryption_service();
        let mut encrypted = Vec::with_capacity(commits.len());
        for commit in &commits {
            let data = encryption.encrypt_commit(commit.storage_bytes()).await?;
            encrypted.push(CloudCommit {
                id: *commit.id(),
                data: Bytes::from(data),
            });
        }
        self.cloud.add_commits(encrypted).await?;
        for commit in &commits {
            self.storage.mark_commit_synced(commit.id()).await?;
        }
        debug!(
            page = %self.storage.page_id(),
            pieces = piece_count,
            commits = commits.len(),
            "uploaded local changes"
        );
        Ok(commits.len())
    }

    async fn upload_pieces(&self, pieces: Vec<ObjectIdentifier>) -> SyncResult<()> {
        let mut tasks = JoinSet::new();
        let mut result = Ok(());
        for identifier in pieces {
            if tasks.len() >= self.concurrency {
                result = result.and(join_one(&mut tasks).await);
                if result.is_err() {
                    break;
                }
            }
            let storage = Arc::clone(&self.storage);
            let cloud = Arc::clone(&self.cloud);
            tasks.spawn(async move { upload_piece(&storage, cloud.as_ref(), &identifier).await });
        }
        while !tasks.is_empty() {
            result = result.and(join_one(&mut tasks).await);
        }
        result
    }
}

async fn join_one(tasks: &mut JoinSet<SyncResult<()>>) -> SyncResult<()> {
    match tasks.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(SyncError::Internal(format!("upload task failed: {e}"))),
        None => Ok(()),
    }
}

async fn upload_piece(
    storage: &PageStorage,
    cloud: &dyn PageCloud,
    identifier: &ObjectIdentifier,
) -> SyncResult<()> {
    let piece = storage.get_piece(identifier).await?;
    let encryption = storage.encryption_service();
    let name = encryption.get_object_name(identifier).await?;
    let data = encryption.encrypt_object(identifier, piece.data()).await?;
    cloud.add_object(&name, Bytes::from(data)).await?;
    storage.mark_piece_synced(identifier).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use crate::memory::{CloudOp, InMemoryPageCloud};
    use crate::test_util::{open_page, put};
    use ledger_types::CommitId;

    const LONG_VALUE: &str = "a value long enough to be stored as its own piece";

    #[tokio::test]
    async fn pieces_then_commits_are_uploaded_and_marked() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        let c1 = put(&storage, &CommitId::FIRST, "a", LONG_VALUE).await;
        let c2 = put(&storage, c1.id(), "b", "short").await;
        let pieces = storage.get_unsynced_pieces().await.unwrap();
        assert!(!pieces.is_empty());

        let uploaded = BatchUpload::new(Arc::clone(&storage), cloud.clone(), 2)
            .start()
            .await
            .unwrap();

        assert_eq!(uploaded, 2);
        assert_eq!(
            cloud.commits().iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![*c1.id(), *c2.id()]
        );
        assert_eq!(cloud.object_count(), pieces.len());
        assert!(storage.is_synced().await.unwrap());
        assert!(storage.is_online().await.unwrap());
    }

    #[tokio::test]
    async fn nothing_to_upload() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        let uploaded = BatchUpload::new(storage, cloud.clone(), 4).start().await.unwrap();
        assert_eq!(uploaded, 0);
        assert_eq!(cloud.calls(CloudOp::AddCommits), 0);
    }

    #[tokio::test]
    async fn failed_piece_keeps_commits_unsynced() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        let c1 = put(&storage, &CommitId::FIRST, "a", LONG_VALUE).await;
        cloud.fail_next(CloudOp::AddObject, CloudError::Network("down".into()), 1);

        let err = BatchUpload::new(Arc::clone(&storage), cloud.clone(), 1)
            .start()
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(cloud.calls(CloudOp::AddCommits), 0);
        assert!(!storage.is_commit_synced(c1.id()).await.unwrap());

        BatchUpload::new(Arc::clone(&storage), cloud.clone(), 1)
            .start()
            .await
            .unwrap();
        assert!(storage.is_commit_synced(c1.id()).await.unwrap());
        assert!(cloud.has_commit(c1.id()));
    }

    #[tokio::test]
    async fn rejected_commits_stay_unsynced() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        let c1 = put(&storage, &CommitId::FIRST, "a", "1").await;
        cloud.fail_next(CloudOp::AddCommits, CloudError::Server("full".into()), 1);

        let err = BatchUpload::new(Arc::clone(&storage), cloud.clone(), 4)
            .start()
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(!storage.is_commit_synced(c1.id()).await.unwrap());
        assert!(!cloud.has_commit(c1.id()));
    }

    #[tokio::test]
    async fn uploaded_objects_decrypt_to_the_pieces() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        put(&storage, &CommitId::FIRST, "a", LONG_VALUE).await;
        let pieces = storage.get_unsynced_pieces().await.unwrap();
        BatchUpload::new(Arc::clone(&storage), cloud.clone(), 4)
            .start()
            .await
            .unwrap();

        let encryption = storage.encryption_service();
        for identifier in pieces {
            let name = encryption.get_object_name(&identifier).await.unwrap();
            let stored = cloud.get_object(&name).await.unwrap();
            let plain = encryption.decrypt_object(&identifier, &stored).await.unwrap();
            let piece = storage.get_piece(&identifier).await.unwrap();
            assert_eq!(&plain[..], &piece.data()[..]);
        }
    }
}
