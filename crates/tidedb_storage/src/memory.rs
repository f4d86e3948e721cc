//! In-memory storage backend for testing.

use crate::backend::{BatchOp, StorageBackend, WriteBatch};
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type KeyspaceMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// An in-memory storage backend.
///
/// All data lives in memory, making this backend suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral stores that don't need persistence
///
/// # Thread Safety
///
/// A single `RwLock` over the keyspace map makes batch application atomic
/// with respect to readers: a `get` or `scan` sees either all of a batch
/// or none of it.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    keyspaces: RwLock<KeyspaceMap>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of all non-empty keyspaces.
    ///
    /// Useful for testing and debugging.
    #[must_use]
    pub fn keyspace_names(&self) -> Vec<String> {
        self.keyspaces.read().keys().cloned().collect()
    }

    /// Removes all data.
    pub fn clear(&self) {
        self.keyspaces.write().clear();
    }

    pub(crate) fn apply_to_map(map: &mut KeyspaceMap, batch: &WriteBatch) {
        for op in batch.ops() {
            match op {
                BatchOp::Put {
                    keyspace,
                    key,
                    value,
                } => {
                    map.entry(keyspace.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                BatchOp::Delete { keyspace, key } => {
                    if let Some(ks) = map.get_mut(keyspace) {
                        ks.remove(key);
                    }
                }
                BatchOp::DeletePrefix { keyspace, prefix } => {
                    if let Some(ks) = map.get_mut(keyspace) {
                        ks.retain(|k, _| !k.starts_with(prefix.as_str()));
                    }
                }
            }
        }
    }
}

impl StorageBackend for MemoryBackend {
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
        let mut keyspaces = self.keyspaces.write();
        Self::apply_to_map(&mut keyspaces, &batch);
        Ok(())
    }

    fn count(&self, keyspace: &str) -> StorageResult<usize> {
        let keyspaces = self.keyspaces.read();
        Ok(keyspaces.get(keyspace).map_or(0, BTreeMap::len))
    }

    fn sync(&self) -> StorageResult<()> {
        // Nothing to make durable
        Ok(())
    }
}
