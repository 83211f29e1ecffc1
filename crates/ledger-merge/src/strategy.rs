use async_trait::async_trait;

use ledger_dag::Commit;
use ledger_page::PageStorage;

use crate::error::MergeResult;

/// A way of merging two heads of a page.
///
/// `left` is older than `right` by `(timestamp, id)` and `base` is their
/// single common ancestor. On success the strategy has committed a merge
/// journal with `left` and `right` as parents.
#[async_trait]
pub trait MergeStrategy: Send + Sync {
    async fn merge(
        &self,
        storage: &PageStorage,
        left: &Commit,
        right: &Commit,
        base: &Commit,
    ) -> MergeResult<()>;

    /// Stop the merge in flight, if any. It fails with
    /// [`MergeError::Interrupted`](crate::MergeError::Interrupted) at its
    /// next suspension point.
    fn cancel(&self);
}
