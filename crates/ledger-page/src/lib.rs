//! Storage engine for one Ledger page.
//!
//! A page is a key/value map whose history is a commit DAG. [`PageStorage`]
//! owns that history: it creates commits from [`Journal`]s, ingests commits
//! from sync, stores and fetches objects, and prunes history that is no
//! longer needed.
//!
//! # Key Types
//!
//! - [`PageStorage`] -- The engine; also the tree and commit-graph backend
//! - [`Journal`] -- Staged edits producing the next commit
//! - [`AddCommitsOutcome`] -- Added and missing commits of an ingestion
//! - [`CommitWatcher`] -- Observer of new commits
//! - [`PageSyncDelegate`] -- Source of pieces missing locally
//! - [`PageStorageConfig`] -- Pruning and orphan backlog settings
//!
//! # Invariants
//!
//! - The head set is never empty once the page is open.
//! - Every head-set change happens in one batch under the ingestion lock.
//! - A committed tree never points at a transient piece.

pub mod config;
pub mod delegate;
pub mod journal;
pub mod page_storage;
pub mod pruner;
pub mod watcher;

pub use config::{PageStorageConfig, PruningPolicy};
pub use delegate::{PageSyncDelegate, RemotePiece, RetrievedObjectType};
pub use journal::{Journal, JournalChange};
pub use page_storage::{AddCommitsOutcome, PageStorage};
pub use pruner::prune;
pub use watcher::CommitWatcher;
