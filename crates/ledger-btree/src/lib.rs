//! Content-addressed B-tree for Ledger pages.
//!
//! A page's contents at a commit are a sorted map from keys to value objects,
//! stored as a tree of immutable nodes. The level of each key is derived
//! from its hash, so the tree shape depends only on the set of keys and two
//! commits with equal contents share the same root.
//!
//! # Key Types
//!
//! - [`TreeNode`] -- One node: sorted entries plus child subtrees
//! - [`TreeStorage`] -- Object access provided by page storage
//!
//! Trees are built with [`build_tree`] / [`apply_changes`], read with
//! [`for_each_entry`] / [`get_entry`], and compared with [`for_each_diff`] /
//! [`for_each_three_way_diff`], which skip shared subtrees.

pub mod builder;
pub mod diff;
pub mod iterator;
pub mod node;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_util;

pub use builder::{apply_changes, build_tree};
pub use diff::{for_each_diff, for_each_three_way_diff, for_each_two_way_diff, TwoWayChange};
pub use iterator::{collect_entries, for_each_entry, for_each_node, get_entry};
pub use node::{node_level, TreeNode};
pub use storage::{read_node, write_node, TreeStorage};
