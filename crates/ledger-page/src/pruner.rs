//! Removal of obsolete history.
//!
//! Every head descends from the latest unique common ancestor (LUCA) of the
//! heads, and every path from a head to the first commit goes through it.
//! The commits strictly before it are never needed again locally once they
//! are synced.

use std::collections::HashSet;

use tracing::{debug, info};

use ledger_dag::find_unique_common_ancestor;
use ledger_store::{StorageError, StorageResult};

use crate::page_storage::PageStorage;

/// Delete the synced strict ancestors of the heads' LUCA. Returns the number
/// of deleted commits.
///
/// Nothing is deleted while any of those ancestors is unsynced.
pub async fn prune(storage: &PageStorage) -> StorageResult<usize> {
    let _pruning = storage.pruning.lock().await;
    let heads = storage.get_head_commits().await?;
    let luca = find_unique_common_ancestor(storage, heads).await?;

    let mut pending = luca.parent_ids().to_vec();
    let mut seen = HashSet::new();
    let mut obsolete = Vec::new();
    while let Some(id) = pending.pop() {
        if id.is_first() || !seen.insert(id) {
            continue;
        }
        let commit = match storage.get_commit(&id).await {
            Ok(commit) => commit,
            // Pruned earlier.
            Err(StorageError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        if !storage.is_commit_synced(&id).await? {
            debug!(
                page = %storage.page_id(),
                commit = %id.short_hex(),
                "unsynced ancestor, pruning postponed"
            );
            return Ok(0);
        }
        pending.extend(commit.parent_ids().iter().copied());
        obsolete.push(commit);
    }

    let count = obsolete.len();
    if count > 0 {
        storage.delete_commits(obsolete).await?;
        info!(
            page = %storage.page_id(),
            luca = %luca.id().short_hex(),
            pruned = count,
            "pruned history"
        );
    }
    Ok(count)
}
