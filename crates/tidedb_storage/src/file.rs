//! File-based storage backend for persistent stores.

use crate::backend::{StorageBackend, WriteBatch};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

type KeyspaceMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// A file-based storage backend.
///
/// Batches are appended to a JSON-lines log and replayed into memory when
/// the store is opened, so reads are served from memory while every
/// applied batch is durable. [`FileBackend::compact`] rewrites the log as
/// a single snapshot batch to reclaim space.
///
/// An exclusive advisory lock on the log file prevents two processes from
/// opening the same store.
///
/// # Example
///
/// ```no_run
/// use tidedb_storage::{FileBackend, StorageBackend, WriteBatch};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("store.tdb")).unwrap();
/// let mut batch = WriteBatch::new();
/// batch.put("docs", "foo", b"{}".to_vec());
/// backend.apply(batch).unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    /// Log writer; held locked so the advisory lock lives with the handle.
    log: Mutex<File>,
    keyspaces: RwLock<KeyspaceMap>,
}

impl FileBackend {
    /// Opens or creates a store at the given path.
    ///
    /// Existing log records are replayed to rebuild the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the store,
    /// [`StorageError::Corrupted`] if a log record cannot be decoded, or an
    /// I/O error.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        let mut keyspaces = KeyspaceMap::new();
        let reader = BufReader::new(&file);
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let batch: WriteBatch = serde_json::from_str(&line).map_err(|e| {
                StorageError::corrupted(format!("bad log record at line {}: {e}", lineno + 1))
            })?;
            crate::memory::MemoryBackend::apply_to_map(&mut keyspaces, &batch);
        }

        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(file),
            keyspaces: RwLock::new(keyspaces),
        })
    }

    /// Opens or creates a store, creating parent directories if needed.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log as one snapshot batch, dropping superseded records.
    ///
    /// The snapshot is written to a sibling temp file and renamed over the
    /// log so a crash mid-compaction leaves the old log intact.
    pub fn compact(&self) -> StorageResult<()> {
        let mut log = self.log.lock();
        let keyspaces = self.keyspaces.read();

        let mut snapshot = WriteBatch::new();
        for (keyspace, records) in keyspaces.iter() {
            for (key, value) in records {
                snapshot.put(keyspace, key, value.clone());
            }
        }

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            let line = serde_json::to_string(&snapshot)
                .map_err(|e| StorageError::corrupted(e.to_string()))?;
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        // Reacquire the handle and lock on the new inode.
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        file.try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;
        *log = file;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, keyspace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let keyspaces = self.keyspaces.read();
        Ok(keyspaces
            .get(keyspace)
            .and_then(|ks| ks.get(key))
            .cloned())
    }

    fn scan(&self, keyspace: &str, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let keyspaces = self.keyspaces.read();
        let Some(ks) = keyspaces.get(keyspace) else {
            return Ok(Vec::new());
        };
        Ok(ks
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Log first; memory state only changes once the record is written.
        let mut log = self.log.lock();
        let line =
            serde_json::to_string(&batch).map_err(|e| StorageError::corrupted(e.to_string()))?;
        log.write_all(line.as_bytes())?;
        log.write_all(b"\n")?;
        log.flush()?;

        let mut keyspaces = self.keyspaces.write();
        crate::memory::MemoryBackend::apply_to_map(&mut keyspaces, &batch);
        Ok(())
    }

    fn count(&self, keyspace: &str) -> StorageResult<usize> {
        let keyspaces = self.keyspaces.read();
        Ok(keyspaces.get(keyspace).map_or(0, BTreeMap::len))
    }

    fn sync(&self) -> StorageResult<()> {
        self.log.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.count("docs").unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_apply_and_get() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let backend = FileBackend::open(&path).unwrap();
        let mut batch = WriteBatch::new();
        batch.put("docs", "a", vec![1, 2, 3]);
        backend.apply(batch).unwrap();

        assert_eq!(backend.get("docs", "a").unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn file_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        {
            let backend = FileBackend::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("docs", "a", vec![1]);
            batch.put("seq", "000001", vec![2]);
            backend.apply(batch).unwrap();

            let mut batch = WriteBatch::new();
            batch.delete("docs", "a");
            backend.apply(batch).unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert!(backend.get("docs", "a").unwrap().is_none());
        assert_eq!(backend.get("seq", "000001").unwrap(), Some(vec![2]));
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let _first = FileBackend::open(&path).unwrap();
        let second = FileBackend::open(&path);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn file_compact_preserves_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let backend = FileBackend::open(&path).unwrap();
        for i in 0..10u8 {
            let mut batch = WriteBatch::new();
            batch.put("docs", "a", vec![i]);
            backend.apply(batch).unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();

        backend.compact().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);
        assert_eq!(backend.get("docs", "a").unwrap(), Some(vec![9]));

        // State survives a reopen of the compacted log.
        drop(backend);
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("docs", "a").unwrap(), Some(vec![9]));
    }

    #[test]
    fn file_corrupt_log_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tdb");
        std::fs::write(&path, b"not json\n").unwrap();

        let result = FileBackend::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("store.tdb");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.count("docs").unwrap(), 0);
        assert!(path.exists());
    }
}
