use ledger_dag::Commit;
use ledger_types::ChangeSource;

/// Observer of commits added to a page.
pub trait CommitWatcher: Send + Sync {
    /// Called once per successful ingestion with the added commits, in the
    /// order they were received.
    fn on_new_commits(&self, commits: &[Commit], source: ChangeSource);
}
