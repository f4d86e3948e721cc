//! Storage backend trait definition.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};

/// A single staged operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Stores (or replaces) a record.
    Put {
        /// Keyspace the record belongs to.
        keyspace: String,
        /// Record key, unique within the keyspace.
        key: String,
        /// Opaque record bytes.
        value: Vec<u8>,
    },
    /// Removes a record if present.
    Delete {
        /// Keyspace the record belongs to.
        keyspace: String,
        /// Record key.
        key: String,
    },
    /// Removes every record whose key starts with `prefix`.
    DeletePrefix {
        /// Keyspace to sweep.
        keyspace: String,
        /// Key prefix to remove.
        prefix: String,
    },
}

/// An ordered set of operations applied atomically.
///
/// Batches are the transaction boundary of the substrate: a backend must
/// apply all operations of a batch or none of them, and no reader may
/// observe a partially applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a put.
    pub fn put(&mut self, keyspace: &str, key: &str, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            keyspace: keyspace.to_string(),
            key: key.to_string(),
            value,
        });
    }

    /// Stages a delete.
    pub fn delete(&mut self, keyspace: &str, key: &str) {
        self.ops.push(BatchOp::Delete {
            keyspace: keyspace.to_string(),
            key: key.to_string(),
        });
    }

    /// Stages removal of every key under `prefix`.
    pub fn delete_prefix(&mut self, keyspace: &str, prefix: &str) {
        self.ops.push(BatchOp::DeletePrefix {
            keyspace: keyspace.to_string(),
            prefix: prefix.to_string(),
        });
    }

    /// Returns the staged operations in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Returns true if no operations are staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the number of staged operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// A low-level storage backend for TideDB.
///
/// Backends are opaque record stores partitioned into named keyspaces.
/// Keys are ordered byte-wise within a keyspace; `scan` returns records in
/// key order.
///
/// # Invariants
///
/// - `apply` is atomic: all operations of the batch or none
/// - `get` after a successful `apply` observes the batch's effects
/// - `sync` makes previously applied batches durable
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads the record at `key` in `keyspace`, if present.
    fn get(&self, keyspace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Returns all records in `keyspace` whose keys start with `prefix`,
    /// in ascending key order. An empty prefix returns the whole keyspace.
    fn scan(&self, keyspace: &str, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be made durable; in that case
    /// none of its operations are visible.
    fn apply(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Returns the number of records in `keyspace`.
    fn count(&self, keyspace: &str) -> StorageResult<usize>;

    /// Syncs all applied batches to durable storage.
    fn sync(&self) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_records_ops_in_order() {
        let mut batch = WriteBatch::new();
        batch.put("a", "k1", vec![1]);
        batch.delete("a", "k2");
        batch.delete_prefix("b", "v/");

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[0], BatchOp::Put { .. }));
        assert!(matches!(batch.ops()[1], BatchOp::Delete { .. }));
        assert!(matches!(batch.ops()[2], BatchOp::DeletePrefix { .. }));
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
