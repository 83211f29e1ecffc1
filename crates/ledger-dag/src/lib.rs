//! Commit records and the commit graph of a Ledger page.
//!
//! A page's history is a DAG of immutable commits. Each commit names the
//! root of a content tree, up to two parents, a generation (one more than
//! its highest parent) and a timestamp.
//!
//! # Key Types
//!
//! - [`Commit`] -- Immutable commit, content-addressed by its serialized form
//! - [`HeadSet`] -- In-memory cache of the commits without children
//! - [`CommitGraph`] -- Commit lookup used by the graph algorithms
//! - [`CommitComparison`] -- How two heads relate in the graph
//!
//! # Invariants
//!
//! - The graph is acyclic: a commit's id depends on its parents' ids.
//! - Parents are stored sorted, so merging the same heads twice converges.
//! - The first commit has the reserved all-zero id and generation 0.

pub mod commit;
pub mod graph;
pub mod heads;

pub use commit::{wall_clock_nanos, Commit};
pub use graph::{find_common_ancestors, find_unique_common_ancestor, CommitComparison, CommitGraph};
pub use heads::HeadSet;
