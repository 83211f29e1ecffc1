use std::sync::{Arc, Weak};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use ledger_dag::Commit;
use ledger_page::{CommitWatcher, PageStorage};
use ledger_types::{ChangeSource, ExponentialBackoff};

use crate::batch_upload::BatchUpload;
use crate::cloud::PageCloud;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::state::{DownloadSyncState, UploadSyncState};

/// What a single upload attempt ran into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    /// Nothing left to upload.
    Done,
    Uploaded(usize),
    WaitDownload,
    TooManyHeads,
}

/// Upload half of a page sync.
///
/// Woken by local commits. Uploads only after the remote backlog has been
/// applied, while the download is idle and while the page has a single
/// head, so that the cloud never receives a branch it would have to merge.
pub struct PageUpload {
    storage: Arc<PageStorage>,
    cloud: Arc<dyn PageCloud>,
    config: SyncConfig,
    download_state: watch::Receiver<DownloadSyncState>,
    backlog_downloaded: watch::Receiver<bool>,
    state: watch::Sender<UploadSyncState>,
    wake: Notify,
    weak_self: Weak<PageUpload>,
}

impl PageUpload {
    pub fn new(
        storage: Arc<PageStorage>,
        cloud: Arc<dyn PageCloud>,
        config: SyncConfig,
        download_state: watch::Receiver<DownloadSyncState>,
        backlog_downloaded: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            storage,
            cloud,
            config,
            download_state,
            backlog_downloaded,
            state: watch::channel(UploadSyncState::NotStarted).0,
            wake: Notify::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Watch the page for local commits and start uploading.
    pub fn start(&self) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        if let Some(this) = weak.upgrade() {
            let watcher: Arc<dyn CommitWatcher> = this;
            self.storage.add_commit_watcher(&watcher);
        }
        tokio::spawn(async move {
            if let Some(this) = weak.upgrade() {
                this.run().await;
            }
        })
    }

    pub fn state(&self) -> UploadSyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadSyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: UploadSyncState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn run(&self) {
        self.set_state(UploadSyncState::Setup);
        let mut download_state = self.download_state.clone();
        let mut backlog = self.backlog_downloaded.clone();
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());

        if !*backlog.borrow() {
            self.set_state(UploadSyncState::WaitRemoteDownload);
            if backlog.wait_for(|done| *done).await.is_err() {
                return;
            }
        }

        loop {
            let waiting = match self.attempt().await {
                Ok(Attempt::Uploaded(count)) => {
                    debug!(commits = count, "upload round finished");
                    backoff.reset();
                    continue;
                }
                Ok(Attempt::Done) => {
                    backoff.reset();
                    UploadSyncState::Idle
                }
                Ok(Attempt::WaitDownload) => UploadSyncState::WaitRemoteDownload,
                Ok(Attempt::TooManyHeads) => UploadSyncState::WaitTooManyLocalHeads,
                Err(e) if !e.is_permanent() => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "upload failed, retrying");
                    self.set_state(UploadSyncState::TemporaryError);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(page = %self.storage.page_id(), error = %e, "upload stopped");
                    self.set_state(UploadSyncState::PermanentError);
                    return;
                }
            };
            self.set_state(waiting);
            tokio::select! {
                _ = self.wake.notified() => {}
                changed = download_state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn attempt(&self) -> SyncResult<Attempt> {
        if self.storage.get_unsynced_commits().await?.is_empty() {
            return Ok(Attempt::Done);
        }
        self.set_state(UploadSyncState::Pending);
        if !self.download_state.borrow().is_idle() {
            return Ok(Attempt::WaitDownload);
        }
        if self.storage.head_count() > 1 {
            return Ok(Attempt::TooManyHeads);
        }
        self.set_state(UploadSyncState::InProgress);
        let batch = BatchUpload::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.cloud),
            self.config.upload_concurrency,
        );
        match batch.start().await? {
            0 => Ok(Attempt::Done),
            count => Ok(Attempt::Uploaded(count)),
        }
    }
}

impl CommitWatcher for PageUpload {
    fn on_new_commits(&self, _commits: &[Commit], source: ChangeSource) {
        if source == ChangeSource::Local {
            self.wake.notify_one();
        }
    }
}

impl std::fmt::Debug for PageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageUpload")
            .field("page", self.storage.page_id())
            .field("state", &self.state())
            .finish()
    }
}
