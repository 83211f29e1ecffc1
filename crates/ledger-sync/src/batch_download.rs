//! Application of downloaded commit batches, with the continuation token
//! persisted after the commits.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::debug;

use ledger_page::{AddCommitsOutcome, PageStorage};
use ledger_types::{ChangeSource, CommitId, PositionToken};

use crate::cloud::CloudCommit;
use crate::error::{SyncError, SyncResult};

/// Sync metadata key under which the continuation token is stored.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Applies one batch of remote commits to a page.
///
/// Commits are decrypted concurrently, stored in a single ingestion, and
/// only then is the continuation token recorded. Re-applying a batch after a
/// crash between the two writes is harmless since ingestion is idempotent.
pub struct BatchDownload {
    storage: Arc<PageStorage>,
    commits: Vec<CloudCommit>,
    position: Option<PositionToken>,
}

impl BatchDownload {
    pub fn new(
        storage: Arc<PageStorage>,
        commits: Vec<CloudCommit>,
        position: Option<PositionToken>,
    ) -> Self {
        Self {
            storage,
            commits,
            position,
        }
    }

    /// Run the batch to completion.
    ///
    /// Fails with [`SyncError::MissingParents`] when the batch does not
    /// connect to the local history; the token is not written then.
    pub async fn start(self) -> SyncResult<AddCommitsOutcome> {
        let count = self.commits.len();
        let entries = self.decrypt_all().await?;
        let outcome = if entries.is_empty() {
            AddCommitsOutcome::default()
        } else {
            self.storage
                .add_commits_from_sync(entries, ChangeSource::Cloud)
                .await?
        };
        if !outcome.missing.is_empty() {
            return Err(SyncError::MissingParents(outcome.missing));
        }
        if let Some(position) = &self.position {
            self.storage
                .set_sync_metadata(TIMESTAMP_KEY, position.as_bytes())
                .await?;
        }
        debug!(
            page = %self.storage.page_id(),
            received = count,
            added = outcome.added.len(),
            "applied remote commits"
        );
        Ok(outcome)
    }

    /// Decrypt every commit, keeping the cloud order.
    async fn decrypt_all(&self) -> SyncResult<Vec<(CommitId, Bytes)>> {
        let mut tasks = JoinSet::new();
        for (index, commit) in self.commits.iter().enumerate() {
            let encryption = Arc::clone(self.storage.encryption_service());
            let commit = commit.clone();
            tasks.spawn(async move {
                let result = encryption.decrypt_commit(&commit.data).await;
                (index, commit.id, result)
            });
        }

        let mut decrypted: Vec<Option<(CommitId, Bytes)>> = vec![None; self.commits.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, id, result) =
                joined.map_err(|e| SyncError::Internal(format!("decryption task failed: {e}")))?;
            decrypted[index] = Some((id, Bytes::from(result?)));
        }
        Ok(decrypted.into_iter().flatten().collect())
    }
}
