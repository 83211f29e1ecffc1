use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use ledger_crypto::{EncryptionService, KeyedEncryptionService};
use ledger_dag::Commit;
use ledger_page::{PageStorage, PageStorageConfig};
use ledger_store::{InMemoryDb, ObjectReferences};
use ledger_types::{BackoffConfig, CommitId, KeyPriority, Location, ObjectType};

use crate::cloud::CloudCommit;
use crate::config::SyncConfig;

/// Every device of a test shares this key.
pub(crate) fn encryption() -> Arc<dyn EncryptionService> {
    Arc::new(KeyedEncryptionService::from_passphrase("sync tests"))
}

pub(crate) async fn open_page() -> Arc<PageStorage> {
    PageStorage::open(
        "page",
        Arc::new(InMemoryDb::new()),
        encryption(),
        PageStorageConfig::default(),
    )
    .await
    .unwrap()
}

/// Short delays so retries show up within a test.
pub(crate) fn fast_config() -> SyncConfig {
    SyncConfig {
        backoff: BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: false,
        },
        ..SyncConfig::default()
    }
}

pub(crate) async fn put(storage: &PageStorage, parent: &CommitId, key: &str, content: &str) -> Commit {
    let value = storage
        .add_object_from_local(
            ObjectType::Blob,
            Bytes::copy_from_slice(content.as_bytes()),
            ObjectReferences::new(),
        )
        .await
        .unwrap();
    let mut journal = storage.start_commit(parent).await.unwrap();
    journal.put(key, value, KeyPriority::Eager);
    storage.commit_journal(journal).await.unwrap().unwrap()
}

pub(crate) async fn read(storage: &PageStorage, commit: &Commit, key: &str) -> Bytes {
    let entry = storage.get_entry_from_commit(commit, key).await.unwrap();
    storage
        .get_object(&entry.object_identifier, Location::Network)
        .await
        .unwrap()
        .into_data()
}

pub(crate) async fn single_head(storage: &PageStorage) -> Commit {
    let mut heads = storage.get_head_commits().await.unwrap();
    assert_eq!(heads.len(), 1, "expected a single head");
    heads.remove(0)
}

/// Commits as another device would have uploaded them.
pub(crate) async fn to_cloud(commits: &[&Commit]) -> Vec<CloudCommit> {
    let encryption = encryption();
    let mut out = Vec::with_capacity(commits.len());
    for commit in commits {
        let data = encryption.encrypt_commit(commit.storage_bytes()).await.unwrap();
        out.push(CloudCommit {
            id: *commit.id(),
            data: Bytes::from(data),
        });
    }
    out
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
