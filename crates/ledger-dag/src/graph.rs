//! Ancestor queries over the commit graph.
//!
//! Both searches walk commits from the highest generation down. A commit's
//! generation is strictly greater than its parents', so by the time a commit
//! is visited every path reaching it from the starting commits has already
//! been explored.

use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use tracing::trace;

use ledger_store::{StorageError, StorageResult};
use ledger_types::CommitId;

use crate::commit::Commit;

/// Commit lookup.
#[async_trait]
pub trait CommitGraph: Send + Sync {
    /// Fails with [`StorageError::NotFound`] if the commit is unknown.
    async fn get_commit(&self, id: &CommitId) -> StorageResult<Commit>;
}

/// How two commits relate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitComparison {
    /// Same contents; nothing to merge.
    Equivalent,
    /// The left commit is an ancestor of the right one.
    LeftSubsetOfRight,
    /// The right commit is an ancestor of the left one.
    RightSubsetOfLeft,
    /// Neither contains the other. Holds the lowest common ancestors,
    /// sorted by id.
    Diverged(Vec<Commit>),
}

const LEFT: u8 = 1;
const RIGHT: u8 = 2;
const STALE: u8 = 4;

/// Compare two commits and find their lowest common ancestors.
pub async fn find_common_ancestors(
    graph: &dyn CommitGraph,
    left: &Commit,
    right: &Commit,
) -> StorageResult<CommitComparison> {
    if left.id() == right.id() || left.root_identifier() == right.root_identifier() {
        return Ok(CommitComparison::Equivalent);
    }

    let mut flags: HashMap<CommitId, u8> = HashMap::new();
    let mut commits: HashMap<CommitId, Commit> = HashMap::new();
    let mut queue: BinaryHeap<(u64, CommitId)> = BinaryHeap::new();
    flags.insert(*left.id(), LEFT);
    flags.insert(*right.id(), RIGHT);
    commits.insert(*left.id(), left.clone());
    commits.insert(*right.id(), right.clone());
    queue.push((left.generation(), *left.id()));
    queue.push((right.generation(), *right.id()));

    let mut ancestors = Vec::new();
    while queue.iter().any(|(_, id)| flags.get(id).is_some_and(|f| f & STALE == 0)) {
        let Some((_, id)) = queue.pop() else { break };
        let mut current = flags.get(&id).copied().unwrap_or(0);
        let commit = commits
            .remove(&id)
            .ok_or_else(|| StorageError::Internal(format!("unqueued commit {}", id.short_hex())))?;
        if current & (LEFT | RIGHT) == LEFT | RIGHT && current & STALE == 0 {
            ancestors.push(commit.clone());
            current |= STALE;
        }
        for parent_id in commit.parent_ids() {
            match flags.get_mut(parent_id) {
                Some(parent_flags) => *parent_flags |= current,
                None => {
                    let parent = match graph.get_commit(parent_id).await {
                        Ok(parent) => parent,
                        // Pruned history only lies below a common ancestor.
                        Err(StorageError::NotFound(_)) if current & STALE != 0 => continue,
                        Err(e) => return Err(e),
                    };
                    flags.insert(*parent_id, current);
                    queue.push((parent.generation(), *parent_id));
                    commits.insert(*parent_id, parent);
                }
            }
        }
    }

    trace!(
        left = %left.id().short_hex(),
        right = %right.id().short_hex(),
        ancestors = ancestors.len(),
        "compared commits"
    );
    if ancestors.len() == 1 {
        if ancestors[0].id() == left.id() {
            return Ok(CommitComparison::LeftSubsetOfRight);
        }
        if ancestors[0].id() == right.id() {
            return Ok(CommitComparison::RightSubsetOfLeft);
        }
    }
    ancestors.sort_by_key(|c| *c.id());
    Ok(CommitComparison::Diverged(ancestors))
}

/// The most recent commit that every path from `heads` to the first commit
/// goes through.
pub async fn find_unique_common_ancestor(
    graph: &dyn CommitGraph,
    heads: Vec<Commit>,
) -> StorageResult<Commit> {
    let mut pending: HashMap<CommitId, Commit> = HashMap::new();
    let mut queue: BinaryHeap<(u64, CommitId)> = BinaryHeap::new();
    for head in heads {
        if !pending.contains_key(head.id()) {
            queue.push((head.generation(), *head.id()));
            pending.insert(*head.id(), head);
        }
    }

    while queue.len() > 1 {
        let Some((_, id)) = queue.pop() else { break };
        let commit = pending
            .remove(&id)
            .ok_or_else(|| StorageError::Internal(format!("unqueued commit {}", id.short_hex())))?;
        for parent_id in commit.parent_ids() {
            if !pending.contains_key(parent_id) {
                let parent = graph.get_commit(parent_id).await?;
                queue.push((parent.generation(), *parent_id));
                pending.insert(*parent_id, parent);
            }
        }
    }

    let (_, id) = queue
        .pop()
        .ok_or_else(|| StorageError::InvalidArgument("no heads given".to_string()))?;
    pending
        .remove(&id)
        .ok_or_else(|| StorageError::Internal(format!("unqueued commit {}", id.short_hex())))
}
