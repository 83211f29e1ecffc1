use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a page.
pub type PageId = String;

/// Where a commit or object came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSource {
    Local,
    Cloud,
    P2p,
}

/// Whether data handed to storage is already known to the cloud.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsObjectSynced {
    No,
    Yes,
}

/// Where an object lookup may go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// Only the local database.
    Local,
    /// The local database, then the sync delegate.
    Network,
}

/// Opaque cloud cursor marking sync progress.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionToken(Vec<u8>);

impl PositionToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PositionToken({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for PositionToken {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}
