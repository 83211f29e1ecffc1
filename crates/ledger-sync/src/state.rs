//! Observable sync states.

use std::fmt;

/// State of the download half of a page sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DownloadSyncState {
    #[default]
    NotStarted,
    /// Retrieving the remote commits not yet known locally.
    Backlog,
    /// Waiting to retry after a transient failure.
    TemporaryError,
    SettingRemoteWatcher,
    Idle,
    /// Applying remote commits or fetching objects.
    InProgress,
    /// Terminal for this sync session.
    PermanentError,
}

impl DownloadSyncState {
    /// Whether no download work is pending or ever will be.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::NotStarted | Self::Idle | Self::PermanentError)
    }
}

/// State of the upload half of a page sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UploadSyncState {
    #[default]
    NotStarted,
    Setup,
    Idle,
    /// Local commits are waiting for upload.
    Pending,
    /// Several local heads exist; a merge must happen first.
    WaitTooManyLocalHeads,
    /// Remote commits must be applied first.
    WaitRemoteDownload,
    InProgress,
    TemporaryError,
    PermanentError,
}

impl UploadSyncState {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::NotStarted | Self::Idle | Self::PermanentError)
    }
}

impl fmt::Display for DownloadSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for UploadSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observer of the combined sync state of a page.
pub trait SyncStateWatcher: Send + Sync {
    /// Called each time either half changes state.
    fn notify(&self, download: DownloadSyncState, upload: UploadSyncState);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_states() {
        assert!(DownloadSyncState::NotStarted.is_idle());
        assert!(DownloadSyncState::Idle.is_idle());
        assert!(DownloadSyncState::PermanentError.is_idle());
        assert!(!DownloadSyncState::Backlog.is_idle());
        assert!(!DownloadSyncState::TemporaryError.is_idle());
        assert!(!DownloadSyncState::InProgress.is_idle());

        assert!(UploadSyncState::Idle.is_idle());
        assert!(UploadSyncState::PermanentError.is_idle());
        assert!(!UploadSyncState::Pending.is_idle());
        assert!(!UploadSyncState::WaitRemoteDownload.is_idle());
    }
}
