//! Durable storage primitives for Ledger pages.
//!
//! This crate sits directly on the durable key/value contract. It knows how
//! rows are laid out for a page, how values are cut into content-addressed
//! pieces, and how pieces refer to each other; it does not know about trees
//! or commit semantics.
//!
//! # Key Types
//!
//! - [`Db`] / [`Batch`] -- Ordered key/value store with atomic batches
//! - [`InMemoryDb`] -- `BTreeMap`-based store for tests and embedding
//! - [`FileDb`] -- Crash-recoverable append-only batch log
//! - [`PageDb`] / [`PageDbBatch`] -- Typed rows of one page
//! - [`Piece`] / [`Object`] / [`FileIndex`] -- Content-addressed data
//! - [`ObjectStatus`] -- Transient, local or synced
//! - [`split_data`] -- Content-defined chunking into pieces
//! - [`StorageError`] -- The storage status taxonomy
//!
//! # Design Rules
//!
//! 1. Pieces are immutable once written; content-addressing guarantees this.
//! 2. Every multi-row change is one batch; nothing is written piecemeal.
//! 3. Piece statuses only increase: transient, then local, then synced.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod db;
pub mod error;
pub mod file;
pub mod memory;
pub mod object;
pub mod page_db;
pub mod split;

pub use db::{Batch, BatchOp, Db};
pub use error::{StorageError, StorageResult};
pub use file::{FileDb, FileDbConfig};
pub use memory::InMemoryDb;
pub use object::{FileIndex, FileIndexChild, Object, ObjectReferences, ObjectStatus, Piece};
pub use page_db::{PageDb, PageDbBatch};
pub use split::{split_data, SplitResult};
