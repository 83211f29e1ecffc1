//! Contract of the remote copy of a page.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use ledger_types::{CommitId, PositionToken};

/// Errors reported by a cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("network error: {0}")]
    Network(String),

    /// Credentials expired; retried once they are refreshed.
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A malformed response or notification.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("server error: {0}")]
    Server(String),
}

impl CloudError {
    /// Whether retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Network(_) | Self::Auth(_))
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// A commit as stored in the cloud: its id and its encrypted storage bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudCommit {
    pub id: CommitId,
    pub data: Bytes,
}

/// Notification delivered by a cloud watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Commits added remotely, with the position following them.
    NewCommits {
        commits: Vec<CloudCommit>,
        position: PositionToken,
    },
    /// The watch failed and delivers nothing more.
    Error(CloudError),
}

/// Remote store of one page's commits and objects.
///
/// Positions are opaque: a position returned with a set of commits marks
/// the point after them, and asking for commits from it returns only those
/// added later. `None` asks for everything.
#[async_trait]
pub trait PageCloud: Send + Sync {
    /// Commits added at or after `min_position`, and the position following
    /// the last of them.
    async fn get_commits(
        &self,
        min_position: Option<&PositionToken>,
    ) -> CloudResult<(Vec<CloudCommit>, Option<PositionToken>)>;

    /// Add commits. Commits already present are ignored.
    async fn add_commits(&self, commits: Vec<CloudCommit>) -> CloudResult<()>;

    async fn get_object(&self, name: &str) -> CloudResult<Bytes>;

    async fn add_object(&self, name: &str, data: Bytes) -> CloudResult<()>;

    /// Follow commits added at or after `min_position`. Dropping the
    /// receiver ends the watch.
    async fn set_watcher(
        &self,
        min_position: Option<&PositionToken>,
    ) -> CloudResult<mpsc::UnboundedReceiver<WatchEvent>>;
}
