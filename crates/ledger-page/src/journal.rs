//! Staging area for the next commit of a page.
//!
//! A [`Journal`] records puts and deletes in a `BTreeMap` keyed by page key.
//! Nothing touches storage until the journal is handed to
//! [`PageStorage::commit_journal`](crate::PageStorage::commit_journal).

use std::collections::BTreeMap;

use ledger_dag::Commit;
use ledger_types::{KeyPriority, ObjectIdentifier};

/// One staged edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalChange {
    Put {
        identifier: ObjectIdentifier,
        priority: KeyPriority,
    },
    Delete,
}

impl JournalChange {
    /// Name of the operation, used to derive merge entry ids.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Delete => "delete",
        }
    }
}

/// Mutable staging area producing a commit on top of one or two parents.
pub struct Journal {
    parents: Vec<Commit>,
    /// Tree the staged edits apply to: the parent's root, or the automatic
    /// merge of both parents.
    base_root: ObjectIdentifier,
    cleared: bool,
    changes: BTreeMap<String, JournalChange>,
}

impl Journal {
    pub(crate) fn simple(parent: Commit) -> Self {
        let base_root = parent.root_identifier().clone();
        Self {
            parents: vec![parent],
            base_root,
            cleared: false,
            changes: BTreeMap::new(),
        }
    }

    pub(crate) fn merge(left: Commit, right: Commit, merged_root: ObjectIdentifier) -> Self {
        Self {
            parents: vec![left, right],
            base_root: merged_root,
            cleared: false,
            changes: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, identifier: ObjectIdentifier, priority: KeyPriority) {
        self.changes.insert(
            key.into(),
            JournalChange::Put {
                identifier,
                priority,
            },
        );
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.changes.insert(key.into(), JournalChange::Delete);
    }

    /// Drop every key of the base tree and every staged edit.
    pub fn clear(&mut self) {
        self.cleared = true;
        self.changes.clear();
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    /// Parents as given when the journal was started.
    pub fn parents(&self) -> &[Commit] {
        &self.parents
    }

    pub fn base_root(&self) -> &ObjectIdentifier {
        &self.base_root
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    pub fn changes(&self) -> &BTreeMap<String, JournalChange> {
        &self.changes
    }

    /// Whether committing would change nothing. Merge journals always
    /// produce a commit.
    pub fn is_noop(&self) -> bool {
        !self.is_merge() && !self.cleared && self.changes.is_empty()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("parents", &self.parents.iter().map(|p| *p.id()).collect::<Vec<_>>())
            .field("changes", &self.changes.len())
            .field("cleared", &self.cleared)
            .finish()
    }
}
