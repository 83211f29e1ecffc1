use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{Batch, Db};
use crate::error::{StorageError, StorageResult};
use crate::memory::{apply_batch, scan};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Durability settings for [`FileDb`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDbConfig {
    /// `fsync` after every batch.
    pub sync_every_batch: bool,
    /// Rewrite the log once it holds this many batches.
    pub compact_after_batches: u64,
}

impl Default for FileDbConfig {
    fn default() -> Self {
        Self {
            sync_every_batch: true,
            compact_after_batches: 10_000,
        }
    }
}

struct LogWriter {
    file: File,
    /// Length of the fully-written prefix of the log.
    len: u64,
    /// Batches appended since the last compaction.
    batches: u64,
    /// Set when a failed append could not be rolled back; the log refuses
    /// further writes until it is reopened.
    broken: bool,
    /// Write only this many bytes of the next frame, then fail.
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl LogWriter {
    fn new(file: File, len: u64, batches: u64) -> Self {
        Self {
            file,
            len,
            batches,
            broken: false,
            #[cfg(test)]
            fail_after: None,
        }
    }

    /// Append one frame. On failure the file is cut back to its last good
    /// length so that a partial frame never precedes a later one.
    fn append(&mut self, frame: &[u8], sync: bool) -> StorageResult<()> {
        if self.broken {
            return Err(StorageError::Io(
                "batch log is unusable after a failed write".to_string(),
            ));
        }
        let written = self.write_and_sync(frame, sync);
        if let Err(e) = written {
            warn!(len = self.len, error = %e, "batch append failed; rolling back");
            if let Err(rollback) = self.rollback() {
                warn!(error = %rollback, "rollback of batch log failed");
                self.broken = true;
            }
            return Err(e);
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    fn write_and_sync(&mut self, frame: &[u8], sync: bool) -> StorageResult<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(StorageError::Io("injected write failure".to_string()));
        }
        self.file.write_all(frame)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len)?;
        self.file.seek(SeekFrom::Start(self.len))?;
        Ok(())
    }
}

/// Crash-recoverable database backed by an append-only batch log.
///
/// Each executed batch is serialized with bincode, framed with a length
/// prefix and a CRC32 checksum, and appended to a single file; the rows are
/// also kept in memory. On open, the log is replayed front-to-back and the
/// first torn or corrupt frame ends recovery: it and everything after it is
/// truncated, so exactly the fully-written batches are visible.
///
/// On-disk frame:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized Batch)]
/// ```
pub struct FileDb {
    path: PathBuf,
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writer: Mutex<LogWriter>,
    config: FileDbConfig,
}

impl FileDb {
    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: &Path, config: FileDbConfig) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (rows, valid_len, batches) = recover(path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != valid_len {
            warn!(path = %path.display(), valid_len, "truncating torn tail of batch log");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        debug!(path = %path.display(), rows = rows.len(), batches, "opened batch log");
        Ok(Self {
            path: path.to_path_buf(),
            rows: RwLock::new(rows),
            writer: Mutex::new(LogWriter::new(file, valid_len, batches)),
            config,
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows currently visible.
    pub fn len(&self) -> usize {
        self.rows.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no rows are visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log as a single batch holding the current rows.
    ///
    /// The new log is written to a temporary file in the same directory and
    /// atomically renamed over the old one.
    pub fn compact(&self) -> StorageResult<()> {
        let mut w = self.writer.lock().expect("lock poisoned");
        let mut batch = Batch::new();
        for (key, value) in self.rows.read().expect("lock poisoned").iter() {
            batch.put(key.clone(), value.clone());
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        if !batch.is_empty() {
            tmp.as_file_mut().write_all(&encode_frame(&batch)?)?;
        }
        tmp.as_file().sync_all()?;
        let mut file = tmp
            .persist(&self.path)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let len = file.seek(SeekFrom::End(0))?;

        *w = LogWriter::new(file, len, u64::from(!batch.is_empty()));
        debug!(path = %self.path.display(), rows = batch.len(), "compacted batch log");
        Ok(())
    }
}

fn encode_frame(batch: &Batch) -> StorageResult<Vec<u8>> {
    let payload = bincode::serialize(batch)?;
    let length = u32::try_from(payload.len())
        .map_err(|_| StorageError::InvalidArgument("batch too large".to_string()))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replay the log. Returns the rows, the length of the valid prefix of the
/// file and the number of batches in it.
fn recover(path: &Path) -> StorageResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64, u64)> {
    let mut rows = BTreeMap::new();
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((rows, 0, 0)),
        Err(e) => return Err(e.into()),
    }

    let mut offset = 0usize;
    let mut batches = 0u64;
    while offset + HEADER_SIZE <= data.len() {
        let header = &data[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let end = offset + HEADER_SIZE + length;
        if length == 0 || end > data.len() {
            warn!(offset, length, "truncated batch frame; stopping recovery");
            break;
        }
        let payload = &data[offset + HEADER_SIZE..end];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(offset, expected = expected_crc, actual = actual_crc, "CRC mismatch; stopping recovery");
            break;
        }
        match bincode::deserialize::<Batch>(payload) {
            Ok(batch) => apply_batch(&mut rows, batch),
            Err(e) => {
                warn!(offset, error = %e, "undecodable batch frame; stopping recovery");
                break;
            }
        }
        batches += 1;
        offset = end;
    }
    Ok((rows, offset as u64, batches))
}

#[async_trait]
impl Db for FileDb {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.rows.read().expect("lock poisoned").get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan(&self.rows.read().expect("lock poisoned"), prefix))
    }

    async fn execute(&self, batch: Batch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&batch)?;
        let needs_compaction = {
            let mut w = self.writer.lock().expect("lock poisoned");
            w.append(&frame, self.config.sync_every_batch)?;
            w.batches += 1;

            // Rows are updated while the writer lock is held so that log order
            // and visibility order agree.
            let mut rows = self.rows.write().expect("lock poisoned");
            apply_batch(&mut rows, batch);
            w.batches >= self.config.compact_after_batches
        };
        if needs_compaction {
            self.compact()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDb")
            .field("path", &self.path)
            .field("row_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Batch {
        let mut batch = Batch::new();
        batch.put(key.as_bytes(), value.as_bytes());
        batch
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.log");
        {
            let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
            db.execute(put("a", "1")).await.unwrap();
            let mut batch = Batch::new();
            batch.delete(b"a".to_vec());
            batch.put(b"b".to_vec(), b"2".to_vec());
            db.execute(batch).await.unwrap();
        }
        let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
        assert_eq!(db.get(b"a").await.unwrap(), None);
        assert_eq!(db.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.log");
        {
            let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
            db.execute(put("kept", "1")).await.unwrap();
            db.execute(put("torn", "2")).await.unwrap();
        }
        // Chop the last frame in half.
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
        assert_eq!(db.get(b"kept").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"torn").await.unwrap(), None);

        // Appends after recovery land after the valid prefix.
        db.execute(put("after", "3")).await.unwrap();
        drop(db);
        let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
        assert_eq!(db.get(b"after").await.unwrap(), Some(b"3".to_vec()));
        assert_eq!(db.len(), 2);
    }

    #[tokio::test]
    async fn failed_append_does_not_hide_later_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.log");
        {
            let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
            db.execute(put("before", "1")).await.unwrap();
            db.writer.lock().unwrap().fail_after = Some(HEADER_SIZE + 3);
            assert!(matches!(
                db.execute(put("failed", "2")).await,
                Err(StorageError::Io(_))
            ));
            assert!(!db.has_key(b"failed").await.unwrap());
            db.execute(put("after", "3")).await.unwrap();
        }
        let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
        assert!(db.has_key(b"before").await.unwrap());
        assert!(!db.has_key(b"failed").await.unwrap());
        assert!(db.has_key(b"after").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_frame_ends_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.log");
        {
            let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
            db.execute(put("a", "1")).await.unwrap();
            db.execute(put("b", "2")).await.unwrap();
        }
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let db = FileDb::open(&path, FileDbConfig::default()).unwrap();
        assert!(db.has_key(b"a").await.unwrap());
        assert!(!db.has_key(b"b").await.unwrap());
    }

    #[tokio::test]
    async fn compaction_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.log");
        let config = FileDbConfig {
            sync_every_batch: false,
            compact_after_batches: 3,
        };
        {
            let db = FileDb::open(&path, config.clone()).unwrap();
            for i in 0..7 {
                db.execute(put(&format!("k{i}"), "v")).await.unwrap();
            }
        }
        let db = FileDb::open(&path, config).unwrap();
        assert_eq!(db.scan_prefix(b"k").await.unwrap().len(), 7);
    }
}
