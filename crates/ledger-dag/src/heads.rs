//! In-memory cache of a page's heads.

use std::collections::{BTreeSet, HashMap};

use ledger_types::CommitId;

/// Heads ordered by `(timestamp, id)`, oldest first.
#[derive(Clone, Debug, Default)]
pub struct HeadSet {
    ordered: BTreeSet<(u64, CommitId)>,
    timestamps: HashMap<CommitId, u64>,
}

impl HeadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_heads(heads: impl IntoIterator<Item = (CommitId, u64)>) -> Self {
        let mut set = Self::new();
        for (id, timestamp) in heads {
            set.insert(id, timestamp);
        }
        set
    }

    pub fn insert(&mut self, id: CommitId, timestamp: u64) {
        if let Some(previous) = self.timestamps.insert(id, timestamp) {
            self.ordered.remove(&(previous, id));
        }
        self.ordered.insert((timestamp, id));
    }

    pub fn remove(&mut self, id: &CommitId) -> bool {
        match self.timestamps.remove(id) {
            Some(timestamp) => self.ordered.remove(&(timestamp, *id)),
            None => false,
        }
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.timestamps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Head ids, oldest first.
    pub fn ids(&self) -> Vec<CommitId> {
        self.ordered.iter().map(|(_, id)| *id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> CommitId {
        CommitId::from_hash([b; 32])
    }

    #[test]
    fn heads_are_ordered_by_timestamp_then_id() {
        let heads = HeadSet::from_heads(vec![(id(3), 5), (id(1), 9), (id(2), 5)]);
        assert_eq!(heads.ids(), vec![id(2), id(3), id(1)]);
    }

    #[test]
    fn reinsert_updates_timestamp() {
        let mut heads = HeadSet::new();
        heads.insert(id(1), 1);
        heads.insert(id(1), 7);
        assert_eq!(heads.len(), 1);
        assert!(heads.remove(&id(1)));
        assert!(heads.is_empty());
        assert!(!heads.remove(&id(1)));
    }
}
