//! Hashing and encryption for Ledger page storage.
//!
//! Provides domain-separated BLAKE3 hashing for pieces and commits, and the
//! [`EncryptionService`] contract through which every byte leaving the device
//! passes.
//!
//! [`KeyedEncryptionService`] builds its keystream, tags and object names
//! from BLAKE3 in keyed mode.

pub mod encryption;
pub mod hasher;
pub mod keyed;

pub use encryption::{ChunkingPermutation, EncryptionError, EncryptionResult, EncryptionService};
pub use hasher::{compute_object_digest, ContentHasher};
pub use keyed::KeyedEncryptionService;
