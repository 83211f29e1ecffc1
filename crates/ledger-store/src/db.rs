use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// A single write inside a [`Batch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A group of writes applied atomically by [`Db::execute`].
///
/// Batches are built entirely in memory; dropping one before execution
/// writes nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Durable, ordered key/value store with atomic batches.
///
/// All implementations must satisfy these invariants:
/// - A batch is either fully visible or not visible at all, including after
///   a crash and restart.
/// - Reads observe every batch whose `execute` has returned.
/// - `scan_prefix` returns rows in ascending key order.
#[async_trait]
pub trait Db: Send + Sync {
    /// Point lookup. Returns `Ok(None)` if the key is absent.
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Whether the key is present.
    async fn has_key(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All rows whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every write of `batch` atomically.
    async fn execute(&self, batch: Batch) -> StorageResult<()>;
}
