use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::db::{Batch, BatchOp, Db};
use crate::error::{StorageError, StorageResult};

/// In-memory, `BTreeMap`-based database.
///
/// Intended for tests and embedding. Rows are held behind a `RwLock`; a batch
/// is applied under a single write lock, so it is never partially visible.
pub struct InMemoryDb {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    failing_executes: AtomicUsize,
    executed: AtomicUsize,
}

impl InMemoryDb {
    /// Create a new empty database.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            failing_executes: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
        }
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.rows.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().expect("lock poisoned").is_empty()
    }

    /// Make the next `count` calls to `execute` fail with an I/O error
    /// without applying anything.
    pub fn fail_next_executes(&self, count: usize) {
        self.failing_executes.store(count, Ordering::SeqCst);
    }

    /// Number of batches applied so far.
    pub fn executed_batches(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Copy of every row, for assertions.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.rows.read().expect("lock poisoned").clone()
    }
}

impl Default for InMemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a batch to an ordered row map.
pub(crate) fn apply_batch(rows: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: Batch) {
    for op in batch.into_ops() {
        match op {
            BatchOp::Put { key, value } => {
                rows.insert(key, value);
            }
            BatchOp::Delete { key } => {
                rows.remove(&key);
            }
        }
    }
}

/// Rows of `rows` whose key starts with `prefix`.
pub(crate) fn scan(rows: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    rows.range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl Db for InMemoryDb {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let rows = self.rows.read().expect("lock poisoned");
        Ok(rows.get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let rows = self.rows.read().expect("lock poisoned");
        Ok(scan(&rows, prefix))
    }

    async fn execute(&self, batch: Batch) -> StorageResult<()> {
        let failing = self
            .failing_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::Io("injected batch failure".to_string()));
        }
        let mut rows = self.rows.write().expect("lock poisoned");
        apply_batch(&mut rows, batch);
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDb")
            .field("row_count", &self.len())
            .finish()
    }
}
