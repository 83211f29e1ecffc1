use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use ledger_page::PageStorage;

use crate::cloud::PageCloud;
use crate::config::SyncConfig;
use crate::page_download::PageDownload;
use crate::page_upload::PageUpload;
use crate::state::{DownloadSyncState, SyncStateWatcher, UploadSyncState};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_backlog_downloaded: Option<Callback>,
    on_idle: Option<Callback>,
    on_unrecoverable_error: Option<Callback>,
    state_watcher: Option<Arc<dyn SyncStateWatcher>>,
}

/// Cloud sync of one page.
///
/// Runs a [`PageDownload`] and a [`PageUpload`] side by side and reports
/// their combined state. Callbacks must be set before [`start`](Self::start).
/// Dropping the sync stops its tasks; the page stays usable locally.
pub struct PageSync {
    storage: Arc<PageStorage>,
    download: Arc<PageDownload>,
    upload: Arc<PageUpload>,
    callbacks: Callbacks,
    tasks: Vec<JoinHandle<()>>,
}

impl PageSync {
    pub fn new(storage: Arc<PageStorage>, cloud: Arc<dyn PageCloud>, config: SyncConfig) -> Self {
        let download = PageDownload::new(Arc::clone(&storage), Arc::clone(&cloud), config.clone());
        let upload = PageUpload::new(
            Arc::clone(&storage),
            cloud,
            config,
            download.subscribe(),
            download.subscribe_backlog(),
        );
        Self {
            storage,
            download,
            upload,
            callbacks: Callbacks::default(),
            tasks: Vec::new(),
        }
    }

    /// Called once the remote backlog has been applied.
    pub fn set_on_backlog_downloaded(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.on_backlog_downloaded = Some(Arc::new(f));
    }

    /// Called each time both halves become idle.
    pub fn set_on_idle(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.on_idle = Some(Arc::new(f));
    }

    /// Called once if either half stops on a permanent error.
    pub fn set_on_unrecoverable_error(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.on_unrecoverable_error = Some(Arc::new(f));
    }

    pub fn set_sync_state_watcher(&mut self, watcher: Arc<dyn SyncStateWatcher>) {
        self.callbacks.state_watcher = Some(watcher);
    }

    /// Start both halves. Calling it again has no effect.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        info!(page = %self.storage.page_id(), "starting cloud sync");
        let monitor = Monitor {
            download: self.download.subscribe(),
            upload: self.upload.subscribe(),
            backlog: self.download.subscribe_backlog(),
            callbacks: std::mem::take(&mut self.callbacks),
        };
        self.tasks.push(tokio::spawn(monitor.run()));
        self.tasks.push(self.download.start());
        self.tasks.push(self.upload.start());
    }

    /// Whether neither half has work pending.
    pub fn is_idle(&self) -> bool {
        self.download.state().is_idle() && self.upload.state().is_idle()
    }

    pub fn state(&self) -> (DownloadSyncState, UploadSyncState) {
        (self.download.state(), self.upload.state())
    }

    pub fn download(&self) -> &Arc<PageDownload> {
        &self.download
    }

    pub fn upload(&self) -> &Arc<PageUpload> {
        &self.upload
    }
}

impl Drop for PageSync {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.storage.clear_sync_delegate();
    }
}

impl std::fmt::Debug for PageSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSync")
            .field("page", self.storage.page_id())
            .field("state", &self.state())
            .field("started", &!self.tasks.is_empty())
            .finish()
    }
}

/// Turns state changes of both halves into callbacks.
struct Monitor {
    download: watch::Receiver<DownloadSyncState>,
    upload: watch::Receiver<UploadSyncState>,
    backlog: watch::Receiver<bool>,
    callbacks: Callbacks,
}

impl Monitor {
    async fn run(mut self) {
        let mut last = None;
        let mut was_idle = false;
        let mut backlog_reported = false;
        let mut error_reported = false;
        loop {
            let state = (*self.download.borrow_and_update(), *self.upload.borrow_and_update());
            if last != Some(state) {
                last = Some(state);
                debug!(download = %state.0, upload = %state.1, "sync state changed");
                if let Some(watcher) = &self.callbacks.state_watcher {
                    watcher.notify(state.0, state.1);
                }
            }

            if !backlog_reported && *self.backlog.borrow_and_update() {
                backlog_reported = true;
                if let Some(f) = &self.callbacks.on_backlog_downloaded {
                    f();
                }
            }

            let failed = state.0 == DownloadSyncState::PermanentError
                || state.1 == UploadSyncState::PermanentError;
            if failed && !error_reported {
                error_reported = true;
                if let Some(f) = &self.callbacks.on_unrecoverable_error {
                    f();
                }
            }

            let started = state.0 != DownloadSyncState::NotStarted
                && state.1 != UploadSyncState::NotStarted;
            let idle = started && state.0.is_idle() && state.1.is_idle();
            if idle && !was_idle {
                if let Some(f) = &self.callbacks.on_idle {
                    f();
                }
            }
            was_idle = idle;

            tokio::select! {
                changed = self.download.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = self.upload.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = self.backlog.changed(), if !backlog_reported => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use ledger_merge::{LastOneWinsMergeStrategy, MergeResolver};
    use ledger_types::{BackoffConfig, CommitId};

    use crate::cloud::CloudError;
    use crate::memory::{CloudOp, InMemoryPageCloud};
    use crate::test_util::{eventually, fast_config, open_page, put, read, single_head};

    #[derive(Default)]
    struct RecordingStateWatcher {
        states: Mutex<Vec<(DownloadSyncState, UploadSyncState)>>,
    }

    impl SyncStateWatcher for RecordingStateWatcher {
        fn notify(&self, download: DownloadSyncState, upload: UploadSyncState) {
            self.states.lock().unwrap().push((download, upload));
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// A device: its own page, a sync to the shared cloud and a resolver.
    struct Device {
        storage: Arc<PageStorage>,
        sync: PageSync,
        _resolver: Arc<MergeResolver>,
        resolver_task: JoinHandle<()>,
    }

    impl Drop for Device {
        fn drop(&mut self) {
            self.resolver_task.abort();
        }
    }

    async fn device(cloud: &Arc<InMemoryPageCloud>) -> Device {
        let storage = open_page().await;
        let resolver = MergeResolver::new(Arc::clone(&storage), BackoffConfig::immediate());
        resolver.set_merge_strategy(Some(Arc::new(LastOneWinsMergeStrategy::new())));
        let resolver_task = resolver.start();
        let mut sync = PageSync::new(Arc::clone(&storage), cloud.clone(), fast_config());
        sync.start();
        Device {
            storage,
            sync,
            _resolver: resolver,
            resolver_task,
        }
    }

    #[tokio::test]
    async fn callbacks_follow_the_state() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        let watcher = Arc::new(RecordingStateWatcher::default());
        let (backlog, on_backlog) = counter();
        let (idle, on_idle) = counter();
        let (errors, on_error) = counter();

        let mut sync = PageSync::new(Arc::clone(&storage), cloud.clone(), fast_config());
        sync.set_sync_state_watcher(watcher.clone());
        sync.set_on_backlog_downloaded(on_backlog);
        sync.set_on_idle(on_idle);
        sync.set_on_unrecoverable_error(on_error);
        sync.start();

        eventually("idle", || async {
            sync.state() == (DownloadSyncState::Idle, UploadSyncState::Idle)
        })
        .await;
        eventually("the idle callback", || async { idle.load(Ordering::SeqCst) >= 1 }).await;
        assert_eq!(backlog.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(sync.is_idle());

        let c1 = put(&storage, &CommitId::FIRST, "a", "1").await;
        eventually("the upload", || async { cloud.has_commit(c1.id()) }).await;
        eventually("the watcher", || async {
            watcher.states.lock().unwrap().last()
                == Some(&(DownloadSyncState::Idle, UploadSyncState::Idle))
        })
        .await;
        let states = watcher.states.lock().unwrap().clone();
        assert!(states.len() >= 2);
        assert!(states.windows(2).all(|w| w[0] != w[1]));
    }

    #[tokio::test]
    async fn permanent_error_is_reported_once() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        cloud.fail_next(CloudOp::GetCommits, CloudError::Parse("garbage".into()), 1);
        let storage = open_page().await;
        let (errors, on_error) = counter();
        let (backlog, on_backlog) = counter();

        let mut sync = PageSync::new(Arc::clone(&storage), cloud.clone(), fast_config());
        sync.set_on_unrecoverable_error(on_error);
        sync.set_on_backlog_downloaded(on_backlog);
        sync.start();

        eventually("the error callback", || async { errors.load(Ordering::SeqCst) == 1 }).await;
        assert_eq!(sync.state().0, DownloadSyncState::PermanentError);
        assert_eq!(backlog.load(Ordering::SeqCst), 0);

        // The page keeps working locally.
        let c1 = put(&storage, &CommitId::FIRST, "a", "1").await;
        assert_eq!(read(&storage, &c1, "a").await, bytes::Bytes::from_static(b"1"));
        assert!(!cloud.has_commit(c1.id()));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_device_catches_up() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let first = device(&cloud).await;
        let c1 = put(&first.storage, &CommitId::FIRST, "a", "a value stored as a separate piece").await;
        eventually("the upload", || async { cloud.has_commit(c1.id()) }).await;

        let second = device(&cloud).await;
        eventually("the download", || async {
            second.storage.get_commit(c1.id()).await.is_ok()
        })
        .await;
        let head = single_head(&second.storage).await;
        assert_eq!(
            read(&second.storage, &head, "a").await,
            bytes::Bytes::from_static(b"a value stored as a separate piece")
        );
        assert!(second.sync.download().is_backlog_downloaded());
    }

    #[tokio::test]
    async fn concurrent_edits_converge() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let left = device(&cloud).await;
        let right = device(&cloud).await;
        for d in [&left, &right] {
            eventually("the backlog", || async { d.sync.download().is_backlog_downloaded() }).await;
        }

        put(&left.storage, &CommitId::FIRST, "a", "from the left device").await;
        put(&right.storage, &CommitId::FIRST, "b", "from the right device").await;

        eventually("convergence", || async {
            let (Ok(l), Ok(r)) = (
                left.storage.get_head_commits().await,
                right.storage.get_head_commits().await,
            ) else {
                return false;
            };
            l.len() == 1
                && r.len() == 1
                && l[0].id() == r[0].id()
                && left.sync.is_idle()
                && right.sync.is_idle()
                && left.storage.is_synced().await.unwrap_or(false)
                && right.storage.is_synced().await.unwrap_or(false)
        })
        .await;

        let head = single_head(&left.storage).await;
        assert!(cloud.has_commit(head.id()));
        for d in [&left, &right] {
            let head = single_head(&d.storage).await;
            assert_eq!(read(&d.storage, &head, "a").await, bytes::Bytes::from_static(b"from the left device"));
            assert_eq!(read(&d.storage, &head, "b").await, bytes::Bytes::from_static(b"from the right device"));
        }
    }

    #[tokio::test]
    async fn dropping_the_sync_stops_it() {
        let cloud = Arc::new(InMemoryPageCloud::new());
        let storage = open_page().await;
        let mut sync = PageSync::new(Arc::clone(&storage), cloud.clone(), fast_config());
        sync.start();
        eventually("the watch", || async { cloud.watcher_count() == 1 }).await;
        drop(sync);

        eventually("the watch to close", || async { cloud.watcher_count() == 0 }).await;
        let c1 = put(&storage, &CommitId::FIRST, "a", "1").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!cloud.has_commit(c1.id()));
    }
}
