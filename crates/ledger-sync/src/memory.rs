//! Process-local cloud used by tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use ledger_types::{CommitId, PositionToken};

use crate::cloud::{CloudCommit, CloudError, CloudResult, PageCloud, WatchEvent};

/// Cloud operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloudOp {
    GetCommits,
    AddCommits,
    GetObject,
    AddObject,
    SetWatcher,
}

#[derive(Default)]
struct Inner {
    /// Commits in arrival order; a position is an index into this list.
    commits: Vec<CloudCommit>,
    commit_ids: HashSet<CommitId>,
    objects: HashMap<String, Bytes>,
    watchers: Vec<mpsc::UnboundedSender<WatchEvent>>,
    faults: HashMap<CloudOp, VecDeque<CloudError>>,
    calls: HashMap<CloudOp, usize>,
}

impl Inner {
    fn enter(&mut self, op: CloudOp) -> CloudResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A page cloud held in memory.
///
/// Several page syncs may share one instance to simulate devices syncing
/// through the same cloud. Watchers are notified synchronously when commits
/// are added.
#[derive(Default)]
pub struct InMemoryPageCloud {
    inner: Mutex<Inner>,
}

fn position(index: usize) -> PositionToken {
    PositionToken::new(index.to_string())
}

fn parse_position(token: Option<&PositionToken>) -> CloudResult<usize> {
    let Some(token) = token else {
        return Ok(0);
    };
    std::str::from_utf8(token.as_bytes())
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CloudError::InvalidArgument(format!("bad position {token:?}")))
}

impl InMemoryPageCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next calls of `op` fail with `error`, once per call.
    pub fn fail_next(&self, op: CloudOp, error: CloudError, times: usize) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let queue = inner.faults.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Number of calls of `op` so far, failed ones included.
    pub fn calls(&self, op: CloudOp) -> usize {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.calls.get(&op).copied().unwrap_or(0)
    }

    pub fn commits(&self) -> Vec<CloudCommit> {
        self.inner.lock().expect("lock poisoned").commits.clone()
    }

    pub fn has_commit(&self, id: &CommitId) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .commit_ids
            .contains(id)
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").objects.len()
    }

    /// Overwrite a stored object, to simulate corruption.
    pub fn replace_object(&self, name: &str, data: Bytes) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .objects
            .insert(name.to_string(), data);
    }

    pub fn object_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut names: Vec<String> = inner.objects.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver `error` to every watcher and drop them.
    pub fn break_watchers(&self, error: CloudError) {
        let watchers = std::mem::take(&mut self.inner.lock().expect("lock poisoned").watchers);
        for watcher in watchers {
            let _ = watcher.send(WatchEvent::Error(error.clone()));
        }
    }

    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.watchers.retain(|w| !w.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl PageCloud for InMemoryPageCloud {
    async fn get_commits(
        &self,
        min_position: Option<&PositionToken>,
    ) -> CloudResult<(Vec<CloudCommit>, Option<PositionToken>)> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.enter(CloudOp::GetCommits)?;
        let start = parse_position(min_position)?.min(inner.commits.len());
        let commits = inner.commits[start..].to_vec();
        Ok((commits, Some(position(inner.commits.len()))))
    }

    async fn add_commits(&self, commits: Vec<CloudCommit>) -> CloudResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.enter(CloudOp::AddCommits)?;
        let mut added = Vec::new();
        for commit in commits {
            if inner.commit_ids.insert(commit.id) {
                inner.commits.push(commit.clone());
                added.push(commit);
            }
        }
        if added.is_empty() {
            return Ok(());
        }
        debug!(added = added.len(), total = inner.commits.len(), "cloud received commits");
        let event = WatchEvent::NewCommits {
            commits: added,
            position: position(inner.commits.len()),
        };
        inner
            .watchers
            .retain(|watcher| watcher.send(event.clone()).is_ok());
        Ok(())
    }

    async fn get_object(&self, name: &str) -> CloudResult<Bytes> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.enter(CloudOp::GetObject)?;
        inner
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("object {name}")))
    }

    async fn add_object(&self, name: &str, data: Bytes) -> CloudResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.enter(CloudOp::AddObject)?;
        inner.objects.entry(name.to_string()).or_insert(data);
        Ok(())
    }

    async fn set_watcher(
        &self,
        min_position: Option<&PositionToken>,
    ) -> CloudResult<mpsc::UnboundedReceiver<WatchEvent>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.enter(CloudOp::SetWatcher)?;
        let start = parse_position(min_position)?.min(inner.commits.len());
        let (tx, rx) = mpsc::unbounded_channel();
        // Commits added since the position are delivered right away.
        if start < inner.commits.len() {
            let _ = tx.send(WatchEvent::NewCommits {
                commits: inner.commits[start..].to_vec(),
                position: position(inner.commits.len()),
            });
        }
        inner.watchers.push(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for InMemoryPageCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("InMemoryPageCloud")
            .field("commits", &inner.commits.len())
            .field("objects", &inner.objects.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(byte: u8) -> CloudCommit {
        CloudCommit {
            id: CommitId::from_hash([byte; 32]),
            data: Bytes::from(vec![byte; 4]),
        }
    }

    #[tokio::test]
    async fn positions_resume_after_seen_commits() {
        let cloud = InMemoryPageCloud::new();
        cloud.add_commits(vec![commit(1), commit(2)]).await.unwrap();

        let (all, next) = cloud.get_commits(None).await.unwrap();
        assert_eq!(all, vec![commit(1), commit(2)]);
        let next = next.unwrap();

        cloud.add_commits(vec![commit(3)]).await.unwrap();
        let (later, _) = cloud.get_commits(Some(&next)).await.unwrap();
        assert_eq!(later, vec![commit(3)]);
    }

    #[tokio::test]
    async fn duplicate_commits_are_ignored() {
        let cloud = InMemoryPageCloud::new();
        cloud.add_commits(vec![commit(1)]).await.unwrap();
        cloud.add_commits(vec![commit(1), commit(2)]).await.unwrap();
        assert_eq!(cloud.commits(), vec![commit(1), commit(2)]);
    }

    #[tokio::test]
    async fn watchers_receive_new_commits() {
        let cloud = InMemoryPageCloud::new();
        cloud.add_commits(vec![commit(1)]).await.unwrap();
        let (_, next) = cloud.get_commits(None).await.unwrap();
        let mut rx = cloud.set_watcher(next.as_ref()).await.unwrap();

        cloud.add_commits(vec![commit(2)]).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::NewCommits {
                commits: vec![commit(2)],
                position: PositionToken::from("2"),
            }
        );
    }

    #[tokio::test]
    async fn watcher_catches_up_from_its_position() {
        let cloud = InMemoryPageCloud::new();
        cloud.add_commits(vec![commit(1), commit(2)]).await.unwrap();
        let mut rx = cloud
            .set_watcher(Some(&PositionToken::from("1")))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::NewCommits { commits, .. } => assert_eq!(commits, vec![commit(2)]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_faults_fail_in_order() {
        let cloud = InMemoryPageCloud::new();
        cloud.fail_next(CloudOp::GetObject, CloudError::Network("down".into()), 2);
        cloud.add_object("name", Bytes::from_static(b"data")).await.unwrap();
        assert!(matches!(cloud.get_object("name").await, Err(CloudError::Network(_))));
        assert!(matches!(cloud.get_object("name").await, Err(CloudError::Network(_))));
        assert_eq!(cloud.get_object("name").await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(cloud.calls(CloudOp::GetObject), 3);
        assert!(matches!(
            cloud.get_object("missing").await,
            Err(CloudError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn broken_watchers_get_the_error() {
        let cloud = InMemoryPageCloud::new();
        let mut rx = cloud.set_watcher(None).await.unwrap();
        cloud.break_watchers(CloudError::Network("reset".into()));
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::Error(CloudError::Network("reset".into()))
        );
        assert!(rx.recv().await.is_none());
        assert_eq!(cloud.watcher_count(), 0);
    }

    #[tokio::test]
    async fn malformed_position_is_rejected() {
        let cloud = InMemoryPageCloud::new();
        assert!(matches!(
            cloud.get_commits(Some(&PositionToken::from("abc"))).await,
            Err(CloudError::InvalidArgument(_))
        ));
    }
}
