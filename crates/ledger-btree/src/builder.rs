//! Deterministic construction of trees from sorted entries.

use std::collections::BTreeMap;

use ledger_store::{StorageError, StorageResult};
use ledger_types::{Entry, EntryChange, Location, ObjectIdentifier};
use tracing::debug;

use crate::iterator::collect_entries;
use crate::node::{node_level, TreeNode};
use crate::storage::{write_node, TreeStorage};

/// A node waiting to be written; children point at earlier planned nodes.
struct PlannedNode {
    level: u8,
    entries: Vec<Entry>,
    children: Vec<Option<usize>>,
}

/// Plan the subtree over `entries` (all at or below `level`), appending its
/// nodes in post-order. Returns the index of the subtree's root.
fn plan(entries: &[(Entry, u8)], level: u8, out: &mut Vec<PlannedNode>) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let mut node_entries = Vec::new();
    let mut children = Vec::new();
    let mut run_start = 0;
    for (i, (entry, entry_level)) in entries.iter().enumerate() {
        if *entry_level == level {
            children.push(plan_run(&entries[run_start..i], out));
            node_entries.push(entry.clone());
            run_start = i + 1;
        }
    }
    children.push(plan_run(&entries[run_start..], out));
    out.push(PlannedNode {
        level,
        entries: node_entries,
        children,
    });
    Some(out.len() - 1)
}

/// Plan a run of lower-level entries as a subtree rooted at its own highest
/// level.
fn plan_run(run: &[(Entry, u8)], out: &mut Vec<PlannedNode>) -> Option<usize> {
    let level = run.iter().map(|(_, l)| *l).max()?;
    plan(run, level, out)
}

/// Build the tree holding exactly `entries` and return its root.
///
/// The same set of entries always yields the same root, whatever the history
/// that produced it.
pub async fn build_tree(
    storage: &dyn TreeStorage,
    entries: impl IntoIterator<Item = Entry>,
) -> StorageResult<ObjectIdentifier> {
    let mut sorted: Vec<(Entry, u8)> = entries
        .into_iter()
        .map(|e| {
            let level = node_level(&e.key);
            (e, level)
        })
        .collect();
    sorted.sort_by(|a, b| a.0.key.cmp(&b.0.key));
    if sorted.windows(2).any(|w| w[0].0.key == w[1].0.key) {
        return Err(StorageError::InvalidArgument(
            "duplicate key in tree entries".to_string(),
        ));
    }

    let mut planned = Vec::new();
    if plan_run(&sorted, &mut planned).is_none() {
        return write_node(storage, &TreeNode::empty()).await;
    }

    let mut written: Vec<ObjectIdentifier> = Vec::with_capacity(planned.len());
    for node in planned {
        let children = node
            .children
            .iter()
            .map(|c| c.map(|index| written[index].clone()))
            .collect();
        let node = TreeNode::new(node.level, node.entries, children)?;
        written.push(write_node(storage, &node).await?);
    }
    debug!(nodes = written.len(), entries = sorted.len(), "built tree");
    written
        .pop()
        .ok_or_else(|| StorageError::Internal("tree plan produced no root".to_string()))
}

/// Apply `changes` to the tree at `root` and return the new root.
pub async fn apply_changes(
    storage: &dyn TreeStorage,
    root: &ObjectIdentifier,
    changes: impl IntoIterator<Item = EntryChange>,
) -> StorageResult<ObjectIdentifier> {
    let mut contents: BTreeMap<String, Entry> = collect_entries(storage, root, Location::Local)
        .await?
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect();
    for change in changes {
        if change.deleted {
            contents.remove(&change.entry.key);
        } else {
            contents.insert(change.entry.key.clone(), change.entry);
        }
    }
    build_tree(storage, contents.into_values()).await
}
