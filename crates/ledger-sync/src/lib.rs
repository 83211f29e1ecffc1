//! Cloud synchronization for Ledger pages.
//!
//! Keeps a local page storage convergent with a remote cloud copy of the
//! page. Download retrieves the backlog of remote commits, then follows a
//! live watch; upload pushes local commits and the pieces they reference.
//! Both sides retry transient failures with exponential backoff and stop
//! for good on permanent ones, leaving the page usable locally.
//!
//! # Key Types
//!
//! - [`PageCloud`] -- Contract of the remote page store
//! - [`InMemoryPageCloud`] -- Process-local cloud with fault injection
//! - [`BatchDownload`] -- Decrypts and applies one batch of remote commits
//! - [`PageDownload`] -- Download state machine; also serves missing pieces
//! - [`BatchUpload`] / [`PageUpload`] -- Upload of unsynced pieces and commits
//! - [`PageSync`] -- Couples download and upload for one page
//!
//! # Invariants
//!
//! - The continuation token is written only after its commits are stored.
//! - A piece or commit is marked synced only after the cloud acknowledged it.
//! - Commits are uploaded only while the page has a single head and the
//!   remote backlog has been applied.

pub mod batch_download;
pub mod batch_upload;
pub mod cloud;
pub mod config;
pub mod error;
pub mod memory;
pub mod page_download;
pub mod page_sync;
pub mod page_upload;
pub mod state;

#[cfg(test)]
pub(crate) mod test_util;

pub use batch_download::{BatchDownload, TIMESTAMP_KEY};
pub use batch_upload::BatchUpload;
pub use cloud::{CloudCommit, CloudError, CloudResult, PageCloud, WatchEvent};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use memory::{CloudOp, InMemoryPageCloud};
pub use page_download::PageDownload;
pub use page_sync::PageSync;
pub use page_upload::PageUpload;
pub use state::{DownloadSyncState, SyncStateWatcher, UploadSyncState};
