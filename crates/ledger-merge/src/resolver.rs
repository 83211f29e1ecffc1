//! Background merging of a page's heads.
//!
//! The resolver registers itself as a [`CommitWatcher`] on the page and
//! wakes a merge task whenever new commits arrive. Each pass takes the two
//! oldest heads and merges them:
//!
//! - if one contains the other, or both have the same contents, a merge
//!   journal is committed without asking the strategy;
//! - otherwise their common ancestors are merged into a single base first
//!   (recursively, creating intermediate merges), and the strategy merges
//!   the heads against that base.
//!
//! Merging two merge commits that arrived from sync is delayed with backoff,
//! giving the device that produced them time to converge first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ledger_dag::{find_common_ancestors, Commit, CommitComparison};
use ledger_page::{CommitWatcher, PageStorage};
use ledger_types::{BackoffConfig, ChangeSource, CommitId, ExponentialBackoff};

use crate::error::{MergeError, MergeResult};
use crate::strategy::MergeStrategy;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a single resolution pass did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The page has a single head.
    NoConflict,
    /// No strategy is set.
    NoStrategy,
    /// A merge commit was created. More passes may be needed.
    Merged,
    /// Both candidates are merge commits; retry after the delay.
    Delayed(Duration),
    /// Every pair of heads failed on unreachable remote data.
    Blocked,
}

/// How a wait for a single head ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolutionWaitStatus {
    NoConflicts,
    ConflictsResolved,
}

#[derive(Default)]
struct ResolverState {
    strategy: Option<Arc<dyn MergeStrategy>>,
    /// Strategy to install once the merge in flight stops.
    next_strategy: Option<Option<Arc<dyn MergeStrategy>>>,
    merging: bool,
}

/// Merges the heads of one page until a single head remains.
pub struct MergeResolver {
    storage: Arc<PageStorage>,
    state: Mutex<ResolverState>,
    backoff: Mutex<ExponentialBackoff>,
    /// Set when the latest commits came from sync.
    may_delay: AtomicBool,
    has_merged: AtomicBool,
    wake: Arc<Notify>,
    settled: Notify,
    weak_self: Weak<MergeResolver>,
}

impl MergeResolver {
    /// Create a resolver for `storage` and register it as a commit watcher.
    /// Nothing is merged until a strategy is set and [`start`](Self::start)
    /// is called.
    pub fn new(storage: Arc<PageStorage>, backoff: BackoffConfig) -> Arc<Self> {
        let resolver = Arc::new_cyclic(|weak_self| Self {
            storage,
            state: Mutex::new(ResolverState::default()),
            backoff: Mutex::new(ExponentialBackoff::new(backoff)),
            may_delay: AtomicBool::new(false),
            has_merged: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
            settled: Notify::new(),
            weak_self: weak_self.clone(),
        });
        let watcher: Arc<dyn CommitWatcher> = resolver.clone();
        resolver.storage.add_commit_watcher(&watcher);
        resolver
    }

    /// Spawn the merge task. It stops once the resolver is dropped.
    pub fn start(&self) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        let wake = self.wake.clone();
        wake.notify_one();
        tokio::spawn(async move {
            let mut delay = None;
            loop {
                match delay.take() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => wake.notified().await,
                }
                let Some(resolver) = weak.upgrade() else {
                    return;
                };
                delay = resolver.run_passes().await;
            }
        })
    }

    /// Replace the strategy. A merge in flight is cancelled and the new
    /// strategy is installed once it stops.
    pub fn set_merge_strategy(&self, strategy: Option<Arc<dyn MergeStrategy>>) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.merging {
            if let Some(current) = &state.strategy {
                current.cancel();
            }
            state.next_strategy = Some(strategy);
            return;
        }
        let has_strategy = strategy.is_some();
        state.strategy = strategy;
        drop(state);
        if has_strategy {
            self.wake.notify_one();
        }
    }

    /// Whether a merge is running.
    pub fn is_merging(&self) -> bool {
        self.state.lock().expect("lock poisoned").merging
    }

    /// Resolve once the page has a single head and no merge is running.
    pub async fn wait_for_no_conflicts(&self) -> ConflictResolutionWaitStatus {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.storage.head_count() == 1 && !self.is_merging() {
                return if self.has_merged.swap(false, Ordering::SeqCst) {
                    ConflictResolutionWaitStatus::ConflictsResolved
                } else {
                    ConflictResolutionWaitStatus::NoConflicts
                };
            }
            settled.await;
        }
    }

    /// Run passes until there is nothing left to merge. Returns the delay
    /// to wait before the next pass, if one was requested.
    async fn run_passes(&self) -> Option<Duration> {
        let mut may_delay = self.may_delay.swap(false, Ordering::SeqCst);
        let delay = loop {
            match self.resolve_once(may_delay).await {
                Ok(ResolveOutcome::Merged) => {}
                Ok(ResolveOutcome::Delayed(delay)) => break Some(delay),
                Ok(_) => break None,
                Err(MergeError::Interrupted) => debug!("merge interrupted"),
                Err(e) => {
                    warn!(error = %e, "merge failed, will retry on the next commit");
                    break None;
                }
            }
            may_delay = self.may_delay.swap(false, Ordering::SeqCst);
        };
        self.settled.notify_waiters();
        delay
    }

    /// Merge the two oldest heads of the page, if there are two.
    ///
    /// With `may_delay`, a pair of merge commits is not merged right away:
    /// the delay to wait is returned instead.
    pub async fn resolve_once(&self, may_delay: bool) -> MergeResult<ResolveOutcome> {
        let Some(strategy) = self.begin() else {
            return Ok(ResolveOutcome::NoStrategy);
        };
        let outcome = self.resolve_with(strategy, may_delay).await;
        self.finish();
        outcome
    }

    /// Mark a merge as running and return the strategy to use.
    fn begin(&self) -> Option<Arc<dyn MergeStrategy>> {
        let mut state = self.state.lock().expect("lock poisoned");
        let strategy = state.strategy.clone()?;
        state.merging = true;
        Some(strategy)
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.merging = false;
        if let Some(next) = state.next_strategy.take() {
            state.strategy = next;
        }
    }

    fn strategy_changed(&self) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .next_strategy
            .is_some()
    }

    fn check_interrupted(&self) -> MergeResult<()> {
        if self.strategy_changed() {
            return Err(MergeError::Interrupted);
        }
        Ok(())
    }

    async fn resolve_with(
        &self,
        strategy: Arc<dyn MergeStrategy>,
        may_delay: bool,
    ) -> MergeResult<ResolveOutcome> {
        let heads = self.storage.get_head_commits().await?;
        if heads.len() < 2 {
            return Ok(ResolveOutcome::NoConflict);
        }

        if heads[0].is_merge() && heads[1].is_merge() {
            if may_delay {
                let delay = self.backoff.lock().expect("lock poisoned").next_delay();
                debug!(delay_ms = delay.as_millis() as u64, "delaying merge of merge commits");
                return Ok(ResolveOutcome::Delayed(delay));
            }
        } else {
            self.backoff.lock().expect("lock poisoned").reset();
        }

        // Heads are ordered oldest first, so `left` is older in every pair.
        for i in 0..heads.len() - 1 {
            for j in i + 1..heads.len() {
                let (left, right) = (heads[i].clone(), heads[j].clone());
                debug!(
                    left = %left.id().short_hex(),
                    right = %right.id().short_hex(),
                    heads = heads.len(),
                    "merging heads"
                );
                match self.recursive_merge(&strategy, left, right).await {
                    Ok(()) => {
                        info!(page = %self.storage.page_id(), "heads merged");
                        return Ok(ResolveOutcome::Merged);
                    }
                    // The ancestors of this pair are not reachable; try the
                    // next pair.
                    Err(e) if e.is_network() => {
                        warn!(error = %e, "merge blocked on remote data");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(ResolveOutcome::Blocked)
    }

    /// Merge `left` and `right`, `left` being the older. When the heads have
    /// several common ancestors, this may only create an intermediate merge
    /// of those ancestors; a later pass then merges the heads.
    fn recursive_merge<'a>(
        &'a self,
        strategy: &'a Arc<dyn MergeStrategy>,
        left: Commit,
        right: Commit,
    ) -> BoxFuture<'a, MergeResult<()>> {
        Box::pin(async move {
            let comparison = find_common_ancestors(self.storage.as_ref(), &left, &right).await?;
            self.check_interrupted()?;

            let ancestors = match comparison {
                CommitComparison::Diverged(ancestors) => ancestors,
                // One side contains the other: the merge keeps the larger
                // contents without asking the strategy.
                _ => {
                    let journal = self
                        .storage
                        .start_merge_commit(left.id(), right.id())
                        .await?;
                    self.has_merged.store(true, Ordering::SeqCst);
                    self.storage.commit_journal(journal).await?;
                    return Ok(());
                }
            };

            let Some(base) = self.merge_set(strategy, ancestors).await? else {
                return Ok(());
            };
            self.check_interrupted()?;

            self.has_merged.store(true, Ordering::SeqCst);
            strategy.merge(&self.storage, &left, &right, &base).await
        })
    }

    /// Find a single commit merging all of `ancestors`.
    ///
    /// Returns `None` if an intermediate merge had to be created instead.
    async fn merge_set(
        &self,
        strategy: &Arc<dyn MergeStrategy>,
        mut ancestors: Vec<Commit>,
    ) -> MergeResult<Option<Commit>> {
        ancestors.sort_by_key(Commit::order_key);
        let mut ancestors = ancestors.into_iter();
        let Some(first) = ancestors.next() else {
            return Err(MergeError::Storage(ledger_store::StorageError::Internal(
                "diverged commits without common ancestor".to_string(),
            )));
        };

        // Merges of every ancestor examined so far. All are at most as
        // recent as the next ancestor.
        let mut merges: Vec<CommitId> = vec![*first.id()];
        for next in ancestors {
            let mut next_merges = Vec::new();
            for merge in &merges {
                next_merges.extend(self.storage.get_merge_commit_ids(merge, next.id()).await?);
            }
            self.check_interrupted()?;

            if next_merges.is_empty() {
                merges.sort();
                let last_merge = self.storage.get_commit(&merges[0]).await?;
                debug!(
                    left = %last_merge.id().short_hex(),
                    right = %next.id().short_hex(),
                    "merging common ancestors"
                );
                if last_merge.order_key() > next.order_key() {
                    self.recursive_merge(strategy, next, last_merge).await?;
                } else {
                    self.recursive_merge(strategy, last_merge, next).await?;
                }
                return Ok(None);
            }
            merges = next_merges;
        }

        merges.sort();
        Ok(Some(self.storage.get_commit(&merges[0]).await?))
    }
}

impl CommitWatcher for MergeResolver {
    fn on_new_commits(&self, _commits: &[Commit], source: ChangeSource) {
        self.may_delay
            .store(source != ChangeSource::Local, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

impl Drop for MergeResolver {
    fn drop(&mut self) {
        // Let the merge task observe that the resolver is gone.
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for MergeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeResolver")
            .field("page", self.storage.page_id())
            .field("merging", &self.is_merging())
            .finish_non_exhaustive()
    }
}
