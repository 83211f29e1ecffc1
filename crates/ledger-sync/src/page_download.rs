//! Cloud-to-local half of page sync: backlog retrieval, the remote watch
//! and on-demand piece fetches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ledger_page::{PageStorage, PageSyncDelegate, RemotePiece, RetrievedObjectType};
use ledger_store::{StorageError, StorageResult};
use ledger_types::{ChangeSource, ExponentialBackoff, IsObjectSynced, ObjectIdentifier, PositionToken};

use crate::batch_download::{BatchDownload, TIMESTAMP_KEY};
use crate::cloud::{CloudCommit, CloudError, PageCloud, WatchEvent};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::DownloadSyncState;

/// Download half of a page sync.
///
/// Retrieves the backlog of remote commits, then follows a cloud watch from
/// the stored continuation token. It is also the page's sync delegate and
/// fetches pieces that are missing locally.
pub struct PageDownload {
    storage: Arc<PageStorage>,
    cloud: Arc<dyn PageCloud>,
    config: SyncConfig,
    /// State of the commit download alone.
    commit_state: Mutex<DownloadSyncState>,
    /// Object fetches currently outstanding.
    fetches: AtomicUsize,
    /// Commit state merged with object fetch activity.
    state: watch::Sender<DownloadSyncState>,
    backlog_downloaded: watch::Sender<bool>,
    weak_self: Weak<PageDownload>,
}

impl PageDownload {
    pub fn new(storage: Arc<PageStorage>, cloud: Arc<dyn PageCloud>, config: SyncConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            storage,
            cloud,
            config,
            commit_state: Mutex::new(DownloadSyncState::NotStarted),
            fetches: AtomicUsize::new(0),
            state: watch::channel(DownloadSyncState::NotStarted).0,
            backlog_downloaded: watch::channel(false).0,
            weak_self: weak_self.clone(),
        })
    }

    /// Register as the page's sync delegate and start downloading.
    ///
    /// The task runs until a permanent error or until it is aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        if let Some(this) = weak.upgrade() {
            let delegate: Arc<dyn PageSyncDelegate> = this;
            self.storage.set_sync_delegate(&delegate);
        }
        tokio::spawn(async move {
            if let Some(this) = weak.upgrade() {
                this.run().await;
            }
        })
    }

    pub fn state(&self) -> DownloadSyncState {
        *self.state.borrow()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<DownloadSyncState> {
        self.state.subscribe()
    }

    /// Whether the backlog has been applied.
    pub fn is_backlog_downloaded(&self) -> bool {
        *self.backlog_downloaded.borrow()
    }

    pub fn subscribe_backlog(&self) -> watch::Receiver<bool> {
        self.backlog_downloaded.subscribe()
    }

    fn set_commit_state(&self, state: DownloadSyncState) {
        *self.commit_state.lock().expect("lock poisoned") = state;
        self.update_state();
    }

    fn update_state(&self) {
        let commit_state = *self.commit_state.lock().expect("lock poisoned");
        let merged = if commit_state != DownloadSyncState::Idle {
            commit_state
        } else if self.fetches.load(Ordering::SeqCst) > 0 {
            DownloadSyncState::InProgress
        } else {
            DownloadSyncState::Idle
        };
        self.state.send_if_modified(|current| {
            let changed = *current != merged;
            *current = merged;
            changed
        });
    }

    async fn run(&self) {
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());
        let position = loop {
            self.set_commit_state(DownloadSyncState::Backlog);
            match self.download_backlog().await {
                Ok(position) => break position,
                Err(e) if !e.is_permanent() => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "backlog download failed, retrying");
                    self.set_commit_state(DownloadSyncState::TemporaryError);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return self.fail(e),
            }
        };
        backoff.reset();
        self.backlog_downloaded.send_replace(true);
        info!(page = %self.storage.page_id(), "backlog downloaded");
        self.follow(position, backoff).await;
    }

    /// Apply the remote commits added since the stored token and return the
    /// position to watch from.
    async fn download_backlog(&self) -> SyncResult<Option<PositionToken>> {
        let stored = self
            .storage
            .get_sync_metadata(TIMESTAMP_KEY)
            .await?
            .map(PositionToken::new);
        let (commits, next) = self.cloud.get_commits(stored.as_ref()).await?;
        if commits.is_empty() {
            return Ok(stored);
        }
        debug!(count = commits.len(), "downloading backlog");
        BatchDownload::new(Arc::clone(&self.storage), commits, next.clone())
            .start()
            .await?;
        Ok(next.or(stored))
    }

    /// Watch the cloud from `position`, reconnecting after transient errors.
    async fn follow(&self, mut position: Option<PositionToken>, mut backoff: ExponentialBackoff) {
        loop {
            self.set_commit_state(DownloadSyncState::SettingRemoteWatcher);
            let error = match self.cloud.set_watcher(position.as_ref()).await {
                Ok(events) => {
                    self.set_commit_state(DownloadSyncState::Idle);
                    self.consume(events, &mut position, &mut backoff).await
                }
                Err(e) => SyncError::Cloud(e),
            };
            if error.is_permanent() {
                return self.fail(error);
            }
            let delay = backoff.next_delay();
            warn!(error = %error, delay_ms = delay.as_millis() as u64, "remote watch lost, reconnecting");
            self.set_commit_state(DownloadSyncState::TemporaryError);
            tokio::time::sleep(delay).await;
        }
    }

    /// Apply watch notifications until the watch fails. Notifications that
    /// arrive while a batch is being applied are merged into the next one.
    async fn consume(
        &self,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        position: &mut Option<PositionToken>,
        backoff: &mut ExponentialBackoff,
    ) -> SyncError {
        loop {
            let (mut commits, mut next) = match events.recv().await {
                Some(WatchEvent::NewCommits { commits, position }) => (commits, position),
                Some(WatchEvent::Error(e)) => return SyncError::Cloud(e),
                None => return SyncError::Cloud(CloudError::Network("watch closed".to_string())),
            };
            let mut pending_error = None;
            while let Ok(event) = events.try_recv() {
                match event {
                    WatchEvent::NewCommits {
                        commits: more,
                        position: later,
                    } => {
                        merge_commits(&mut commits, more);
                        next = later;
                    }
                    WatchEvent::Error(e) => {
                        pending_error = Some(SyncError::Cloud(e));
                        break;
                    }
                }
            }

            self.set_commit_state(DownloadSyncState::InProgress);
            let batch = BatchDownload::new(Arc::clone(&self.storage), commits, Some(next.clone()));
            if let Err(e) = batch.start().await {
                return e;
            }
            *position = Some(next);
            backoff.reset();
            self.set_commit_state(DownloadSyncState::Idle);

            if let Some(e) = pending_error {
                return e;
            }
        }
    }

    fn fail(&self, e: SyncError) {
        error!(page = %self.storage.page_id(), error = %e, "download stopped");
        self.storage.clear_sync_delegate();
        self.set_commit_state(DownloadSyncState::PermanentError);
    }

    async fn fetch_object(&self, identifier: &ObjectIdentifier) -> StorageResult<RemotePiece> {
        let encryption = self.storage.encryption_service();
        let name = encryption.get_object_name(identifier).await?;
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.cloud.get_object(&name).await {
                Ok(encrypted) => {
                    let data = encryption.decrypt_object(identifier, &encrypted).await?;
                    return Ok(RemotePiece {
                        source: ChangeSource::Cloud,
                        is_synced: IsObjectSynced::Yes,
                        data: Bytes::from(data),
                    });
                }
                Err(e) if e.is_permanent() => {
                    warn!(object = %name, error = %e, "object fetch failed");
                    return Err(StorageError::Io(format!("fetching object {name}: {e}")));
                }
                Err(e) if attempts >= self.config.max_get_object_attempts => {
                    warn!(object = %name, attempts, error = %e, "object fetch gave up");
                    return Err(StorageError::Network(format!(
                        "fetching object {name} failed {attempts} times: {e}"
                    )));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!(object = %name, error = %e, delay_ms = delay.as_millis() as u64, "retrying object fetch");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn merge_commits(commits: &mut Vec<CloudCommit>, more: Vec<CloudCommit>) {
    for commit in more {
        if !commits.iter().any(|c| c.id == commit.id) {
            commits.push(commit);
        }
    }
}

/// Counts an object fetch as outstanding until dropped.
struct FetchGuard<'a>(&'a PageDownload);

impl<'a> FetchGuard<'a> {
    fn new(download: &'a PageDownload) -> Self {
        download.fetches.fetch_add(1, Ordering::SeqCst);
        download.update_state();
        Self(download)
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetches.fetch_sub(1, Ordering::SeqCst);
        self.0.update_state();
    }
}

#[async_trait]
impl PageSyncDelegate for PageDownload {
    async fn get_object(
        &self,
        identifier: &ObjectIdentifier,
        _retrieved_type: RetrievedObjectType,
    ) -> StorageResult<RemotePiece> {
        let _guard = FetchGuard::new(self);
        self.fetch_object(identifier).await
    }
}

impl std::fmt::Debug for PageDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDownload")
            .field("page", self.storage.page_id())
            .field("state", &self.state())
            .field("backlog_downloaded", &self.is_backlog_downloaded())
            .finish()
    }
}
