//! Streaming diffs between trees.
//!
//! Two cursors walk the trees in key order. Whenever both are positioned on
//! the same subtree identifier, the subtree is skipped without being read,
//! so the cost of a diff is proportional to the size of the change rather
//! than the size of the trees.

use ledger_store::StorageResult;
use ledger_types::{Entry, EntryChange, Location, ObjectIdentifier, ThreeWayChange};

use crate::iterator::{Cursor, Item};
use crate::storage::TreeStorage;

/// A key-level difference with both sides: `None` means absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TwoWayChange {
    pub base: Option<Entry>,
    pub target: Option<Entry>,
}

impl TwoWayChange {
    fn key(&self) -> &str {
        self.base
            .as_ref()
            .or(self.target.as_ref())
            .map(|e| e.key.as_str())
            .unwrap_or_default()
    }

    /// The change as seen by someone holding only the target tree.
    pub fn into_entry_change(self) -> Option<EntryChange> {
        match (self.base, self.target) {
            (_, Some(target)) => Some(EntryChange::put(target)),
            (Some(base), None) => Some(EntryChange::delete(base)),
            (None, None) => None,
        }
    }
}

/// Pull-based walk over the differences between two trees.
struct TwoWayDiff<'a> {
    base: Cursor<'a>,
    target: Cursor<'a>,
    min_key: String,
}

impl<'a> TwoWayDiff<'a> {
    fn new(
        storage: &'a dyn TreeStorage,
        base_root: &ObjectIdentifier,
        target_root: &ObjectIdentifier,
        location: Location,
        min_key: &str,
    ) -> Self {
        Self {
            base: Cursor::new(storage, base_root, location, min_key),
            target: Cursor::new(storage, target_root, location, min_key),
            min_key: min_key.to_string(),
        }
    }

    /// The next difference in key order, reading only the nodes needed to
    /// find it.
    async fn next(&mut self) -> StorageResult<Option<TwoWayChange>> {
        let base = &mut self.base;
        let target = &mut self.target;
        loop {
            let change = match (base.peek(), target.peek()) {
                (None, None) => return Ok(None),
                (Some(Item::Subtree(a)), Some(Item::Subtree(b))) if a == b => {
                    base.pop();
                    target.pop();
                    continue;
                }
                (Some(Item::Subtree(_)), _) => {
                    base.expand_top().await?;
                    continue;
                }
                (_, Some(Item::Subtree(_))) => {
                    target.expand_top().await?;
                    continue;
                }
                (Some(Item::Entry(a)), Some(Item::Entry(b))) => match a.key.cmp(&b.key) {
                    std::cmp::Ordering::Less => TwoWayChange {
                        base: entry(base.pop()),
                        target: None,
                    },
                    std::cmp::Ordering::Greater => TwoWayChange {
                        base: None,
                        target: entry(target.pop()),
                    },
                    std::cmp::Ordering::Equal => {
                        let same = a.same_value(b);
                        let a = entry(base.pop());
                        let b = entry(target.pop());
                        if same {
                            continue;
                        }
                        TwoWayChange { base: a, target: b }
                    }
                },
                (Some(Item::Entry(_)), None) => TwoWayChange {
                    base: entry(base.pop()),
                    target: None,
                },
                (None, Some(Item::Entry(_))) => TwoWayChange {
                    base: None,
                    target: entry(target.pop()),
                },
            };
            // Nodes straddling `min_key` may still yield smaller keys.
            if change.key() < self.min_key.as_str() {
                continue;
            }
            return Ok(Some(change));
        }
    }
}

/// Call `on_next` with every difference between `base_root` and
/// `target_root` at or after `min_key`, in key order, until it returns
/// `false`.
pub async fn for_each_two_way_diff<F>(
    storage: &dyn TreeStorage,
    base_root: &ObjectIdentifier,
    target_root: &ObjectIdentifier,
    location: Location,
    min_key: &str,
    mut on_next: F,
) -> StorageResult<()>
where
    F: FnMut(TwoWayChange) -> bool + Send,
{
    let mut diff = TwoWayDiff::new(storage, base_root, target_root, location, min_key);
    while let Some(change) = diff.next().await? {
        if !on_next(change) {
            break;
        }
    }
    Ok(())
}

fn entry(item: Option<Item>) -> Option<Entry> {
    match item {
        Some(Item::Entry(e)) => Some(e),
        _ => None,
    }
}

/// Call `on_next` with every [`EntryChange`] turning `base_root` into
/// `target_root`, at or after `min_key`, until it returns `false`.
pub async fn for_each_diff<F>(
    storage: &dyn TreeStorage,
    base_root: &ObjectIdentifier,
    target_root: &ObjectIdentifier,
    location: Location,
    min_key: &str,
    mut on_next: F,
) -> StorageResult<()>
where
    F: FnMut(EntryChange) -> bool + Send,
{
    for_each_two_way_diff(storage, base_root, target_root, location, min_key, |change| {
        match change.into_entry_change() {
            Some(change) => on_next(change),
            None => true,
        }
    })
    .await
}

/// Call `on_next` with every key changed on either side of a three-way
/// comparison, in key order, until it returns `false`.
///
/// A side that did not change the key reports the base value.
pub async fn for_each_three_way_diff<F>(
    storage: &dyn TreeStorage,
    base_root: &ObjectIdentifier,
    left_root: &ObjectIdentifier,
    right_root: &ObjectIdentifier,
    location: Location,
    min_key: &str,
    mut on_next: F,
) -> StorageResult<()>
where
    F: FnMut(ThreeWayChange) -> bool + Send,
{
    // Both sides advance lazily, so stopping early stops the reads too.
    let mut left = TwoWayDiff::new(storage, base_root, left_root, location, min_key);
    let mut right = TwoWayDiff::new(storage, base_root, right_root, location, min_key);
    let mut next_left = None;
    let mut next_right = None;
    loop {
        if next_left.is_none() {
            next_left = left.next().await?;
        }
        if next_right.is_none() {
            next_right = right.next().await?;
        }
        let order = match (&next_left, &next_right) {
            (None, None) => return Ok(()),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(l), Some(r)) => l.key().cmp(r.key()),
        };
        let change = match order {
            std::cmp::Ordering::Less => {
                let Some(l) = next_left.take() else { return Ok(()) };
                ThreeWayChange {
                    right: l.base.clone(),
                    base: l.base,
                    left: l.target,
                }
            }
            std::cmp::Ordering::Greater => {
                let Some(r) = next_right.take() else { return Ok(()) };
                ThreeWayChange {
                    left: r.base.clone(),
                    base: r.base,
                    right: r.target,
                }
            }
            std::cmp::Ordering::Equal => {
                let (Some(l), Some(r)) = (next_left.take(), next_right.take()) else {
                    return Ok(());
                };
                ThreeWayChange {
                    base: l.base,
                    left: l.target,
                    right: r.target,
                }
            }
        };
        if !on_next(change) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_tree;
    use crate::test_util::MemoryTreeStorage;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key{i:05}")).collect()
    }

    async fn diff(
        storage: &MemoryTreeStorage,
        base: &ObjectIdentifier,
        target: &ObjectIdentifier,
        min_key: &str,
    ) -> Vec<EntryChange> {
        let mut out = Vec::new();
        for_each_diff(storage, base, target, Location::Local, min_key, |c| {
            out.push(c);
            true
        })
        .await
        .unwrap();
        out
    }

    #[tokio::test]
    async fn identical_trees_have_no_diff() {
        let storage = MemoryTreeStorage::default();
        let root = build_tree(&storage, names(500).iter().map(|k| storage.entry(k, k)))
            .await
            .unwrap();
        let before = storage.reads();
        assert!(diff(&storage, &root, &root, "").await.is_empty());
        assert_eq!(storage.reads(), before);
    }

    #[tokio::test]
    async fn diff_reports_puts_updates_and_deletes() {
        let storage = MemoryTreeStorage::default();
        let base = build_tree(
            &storage,
            vec![storage.entry("a", "1"), storage.entry("b", "2"), storage.entry("c", "3")],
        )
        .await
        .unwrap();
        let target = build_tree(
            &storage,
            vec![storage.entry("b", "2"), storage.entry("c", "30"), storage.entry("d", "4")],
        )
        .await
        .unwrap();

        let changes = diff(&storage, &base, &target, "").await;
        assert_eq!(
            changes,
            vec![
                EntryChange::delete(storage.entry("a", "1")),
                EntryChange::put(storage.entry("c", "30")),
                EntryChange::put(storage.entry("d", "4")),
            ]
        );

        let from_c = diff(&storage, &base, &target, "c").await;
        assert_eq!(from_c.len(), 2);
        assert_eq!(from_c[0].entry.key, "c");
    }

    #[tokio::test]
    async fn diff_skips_shared_subtrees() {
        let storage = MemoryTreeStorage::default();
        let base = build_tree(&storage, names(3000).iter().map(|k| storage.entry(k, k)))
            .await
            .unwrap();
        let target = crate::builder::apply_changes(
            &storage,
            &base,
            vec![EntryChange::put(storage.entry("key01234", "changed"))],
        )
        .await
        .unwrap();

        let before = storage.reads();
        let changes = diff(&storage, &base, &target, "").await;
        let reads = storage.reads() - before;
        assert_eq!(changes, vec![EntryChange::put(storage.entry("key01234", "changed"))]);
        assert!(reads < storage.node_count(), "read {reads} of {} nodes", storage.node_count());
    }

    #[tokio::test]
    async fn three_way_diff_reports_both_sides() {
        let storage = MemoryTreeStorage::default();
        let base = build_tree(
            &storage,
            vec![storage.entry("a", "1"), storage.entry("b", "2"), storage.entry("c", "3")],
        )
        .await
        .unwrap();
        let left = build_tree(
            &storage,
            vec![storage.entry("a", "10"), storage.entry("b", "2"), storage.entry("c", "3")],
        )
        .await
        .unwrap();
        let right = build_tree(
            &storage,
            vec![storage.entry("a", "11"), storage.entry("b", "2"), storage.entry("d", "4")],
        )
        .await
        .unwrap();

        let mut changes = Vec::new();
        for_each_three_way_diff(&storage, &base, &left, &right, Location::Local, "", |c| {
            changes.push(c);
            true
        })
        .await
        .unwrap();

        let keys: Vec<&str> = changes.iter().filter_map(|c| c.key()).collect();
        assert_eq!(keys, vec!["a", "c", "d"]);
        assert_eq!(changes[0].left, Some(storage.entry("a", "10")));
        assert_eq!(changes[0].right, Some(storage.entry("a", "11")));
        // Unchanged on the left: left reports the base value.
        assert_eq!(changes[1].left, Some(storage.entry("c", "3")));
        assert_eq!(changes[1].right, None);
        assert_eq!(changes[2].base, None);
        assert_eq!(changes[2].left, None);
        assert_eq!(changes[2].right, Some(storage.entry("d", "4")));
    }

    #[tokio::test]
    async fn three_way_diff_stops_reading_when_told_to() {
        let storage = MemoryTreeStorage::default();
        let keys = names(3000);
        let base = build_tree(&storage, keys.iter().map(|k| storage.entry(k, k)))
            .await
            .unwrap();
        let edit = |offset: usize, value: &str| -> Vec<EntryChange> {
            keys.iter()
                .skip(offset)
                .step_by(10)
                .map(|k| EntryChange::put(storage.entry(k, value)))
                .collect()
        };
        let left = crate::builder::apply_changes(&storage, &base, edit(0, "left"))
            .await
            .unwrap();
        let right = crate::builder::apply_changes(&storage, &base, edit(5, "right"))
            .await
            .unwrap();

        let before = storage.reads();
        let mut all = 0;
        for_each_three_way_diff(&storage, &base, &left, &right, Location::Local, "", |_| {
            all += 1;
            true
        })
        .await
        .unwrap();
        let full = storage.reads() - before;
        assert_eq!(all, 600);

        let before = storage.reads();
        let mut first = Vec::new();
        for_each_three_way_diff(&storage, &base, &left, &right, Location::Local, "", |c| {
            first.push(c);
            false
        })
        .await
        .unwrap();
        let early = storage.reads() - before;
        assert_eq!(first[0].key(), Some("key00000"));
        assert!(early * 4 < full, "early stop read {early} nodes, full diff {full}");
    }
}
