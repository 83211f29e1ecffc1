//! In-order traversal of a tree.

use std::collections::HashSet;

use ledger_store::{StorageError, StorageResult};
use ledger_types::{Entry, Location, ObjectIdentifier};

use crate::node::TreeNode;
use crate::storage::{read_node, TreeStorage};

/// Next item of an in-order traversal: an entry, or a subtree not yet loaded.
#[derive(Clone, Debug)]
pub(crate) enum Item {
    Entry(Entry),
    Subtree(ObjectIdentifier),
}

/// Lazy in-order cursor over a tree.
///
/// Subtrees are only loaded when expanded, so two cursors can skip subtrees
/// they share without reading them.
pub(crate) struct Cursor<'a> {
    storage: &'a dyn TreeStorage,
    location: Location,
    min_key: String,
    /// Pending items; the next one is on top.
    stack: Vec<Item>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        storage: &'a dyn TreeStorage,
        root: &ObjectIdentifier,
        location: Location,
        min_key: &str,
    ) -> Self {
        Self {
            storage,
            location,
            min_key: min_key.to_string(),
            stack: vec![Item::Subtree(root.clone())],
        }
    }

    pub(crate) fn peek(&self) -> Option<&Item> {
        self.stack.last()
    }

    pub(crate) fn pop(&mut self) -> Option<Item> {
        self.stack.pop()
    }

    /// Replace the subtree on top by its contents.
    pub(crate) async fn expand_top(&mut self) -> StorageResult<()> {
        let Some(Item::Subtree(id)) = self.stack.pop() else {
            return Err(StorageError::Internal(
                "expanded a cursor item that is not a subtree".to_string(),
            ));
        };
        let node = read_node(self.storage, &id, self.location).await?;
        self.push_node(node);
        Ok(())
    }

    fn push_node(&mut self, node: TreeNode) {
        let entries = node.entries();
        // Entries before `first` and their left subtrees hold only keys
        // below `min_key`.
        let first = entries.partition_point(|e| e.key.as_str() < self.min_key.as_str());
        let children = node.children();
        if let Some(Some(last)) = children.last() {
            self.stack.push(Item::Subtree(last.clone()));
        }
        for i in (first..entries.len()).rev() {
            self.stack.push(Item::Entry(entries[i].clone()));
            if let Some(child) = &children[i] {
                self.stack.push(Item::Subtree(child.clone()));
            }
        }
    }

    /// Advance to the next entry at or after `min_key`.
    pub(crate) async fn next_entry(&mut self) -> StorageResult<Option<Entry>> {
        loop {
            match self.stack.pop() {
                None => return Ok(None),
                Some(Item::Entry(entry)) => {
                    if entry.key >= self.min_key {
                        return Ok(Some(entry));
                    }
                }
                Some(Item::Subtree(id)) => {
                    let node = read_node(self.storage, &id, self.location).await?;
                    self.push_node(node);
                }
            }
        }
    }
}

/// Call `on_next` with every entry at or after `min_key`, in key order,
/// until it returns `false`.
pub async fn for_each_entry<F>(
    storage: &dyn TreeStorage,
    root: &ObjectIdentifier,
    location: Location,
    min_key: &str,
    mut on_next: F,
) -> StorageResult<()>
where
    F: FnMut(Entry) -> bool + Send,
{
    let mut cursor = Cursor::new(storage, root, location, min_key);
    while let Some(entry) = cursor.next_entry().await? {
        if !on_next(entry) {
            break;
        }
    }
    Ok(())
}

/// Every entry of the tree, in key order.
pub async fn collect_entries(
    storage: &dyn TreeStorage,
    root: &ObjectIdentifier,
    location: Location,
) -> StorageResult<Vec<Entry>> {
    let mut entries = Vec::new();
    for_each_entry(storage, root, location, "", |e| {
        entries.push(e);
        true
    })
    .await?;
    Ok(entries)
}

/// Look up a single key.
///
/// Fails with [`StorageError::KeyNotFound`] if the key is absent.
pub async fn get_entry(
    storage: &dyn TreeStorage,
    root: &ObjectIdentifier,
    location: Location,
    key: &str,
) -> StorageResult<Entry> {
    let mut current = root.clone();
    loop {
        let node = read_node(storage, &current, location).await?;
        match node.entries().binary_search_by(|e| e.key.as_str().cmp(key)) {
            Ok(i) => return Ok(node.entries()[i].clone()),
            Err(i) => match &node.children()[i] {
                Some(child) => current = child.clone(),
                None => return Err(StorageError::KeyNotFound(key.to_string())),
            },
        }
    }
}

/// Visit every node of the tree once, parents before children.
pub async fn for_each_node<F>(
    storage: &dyn TreeStorage,
    root: &ObjectIdentifier,
    location: Location,
    mut on_node: F,
) -> StorageResult<()>
where
    F: FnMut(&ObjectIdentifier, &TreeNode) + Send,
{
    let mut seen = HashSet::new();
    let mut pending = vec![root.clone()];
    while let Some(id) = pending.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let node = read_node(storage, &id, location).await?;
        on_node(&id, &node);
        pending.extend(node.children().iter().flatten().cloned());
    }
    Ok(())
}
