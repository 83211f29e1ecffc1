//! Automatic merging for Ledger pages.
//!
//! Concurrent writers on different devices leave a page with several heads.
//! The [`MergeResolver`] watches a page and merges its heads pairwise with a
//! pluggable [`MergeStrategy`] until a single head remains.
//!
//! # Key Types
//!
//! - [`MergeStrategy`] -- Produces a merge commit from two heads and a base
//! - [`LastOneWinsMergeStrategy`] -- Conflicting keys take the newer value
//! - [`MergeResolver`] -- Drives merges as new commits arrive
//!
//! # Invariants
//!
//! - The left head of a merge is older than the right one by
//!   `(timestamp, id)`, so independent resolvers pick the same winner.
//! - Several common ancestors are first merged into a single base, in a
//!   deterministic order, reusing merges that already exist.

pub mod error;
pub mod last_one_wins;
pub mod resolver;
pub mod strategy;

pub use error::{MergeError, MergeResult};
pub use last_one_wins::LastOneWinsMergeStrategy;
pub use resolver::{ConflictResolutionWaitStatus, MergeResolver, ResolveOutcome};
pub use strategy::MergeStrategy;
