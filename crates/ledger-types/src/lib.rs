//! Foundation types for Ledger page storage.
//!
//! This crate provides the identifiers and value types shared by every layer
//! of the page storage and sync core. Every other ledger crate depends on
//! `ledger-types`.
//!
//! # Key Types
//!
//! - [`ObjectDigest`] -- Type-tagged content digest, inlining small content
//! - [`ObjectIdentifier`] -- Digest plus encryption key index and deletion scope
//! - [`ObjectIdentifierFactory`] -- Mints identifiers and tracks which are live
//! - [`CommitId`] -- Content-addressed commit identifier
//! - [`Entry`] / [`EntryChange`] / [`ThreeWayChange`] -- Key-level tree content
//! - [`ChangeSource`] / [`IsObjectSynced`] / [`Location`] -- Provenance of data
//! - [`ExponentialBackoff`] -- Retry delays for the sync layer

pub mod backoff;
pub mod commit_id;
pub mod entry;
pub mod error;
pub mod object;
pub mod source;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use commit_id::CommitId;
pub use entry::{Entry, EntryChange, KeyPriority, ThreeWayChange};
pub use error::TypeError;
pub use object::{
    ObjectDigest, ObjectDigestInfo, ObjectIdentifier, ObjectIdentifierFactory, ObjectType,
    PieceType, STORAGE_HASH_SIZE,
};
pub use source::{ChangeSource, IsObjectSynced, Location, PageId, PositionToken};
