//! Incrementally maintained map/reduce view indexes.

use crate::error::EngineResult;
use crate::registry::ViewDef;
use crate::store::{RevisionStore, META_KEYSPACE};
use crate::types::Sequence;
use crate::view::collation::CollationKey;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tidedb_storage::WriteBatch;

/// Keyspace holding per-document view rows and checkpoints.
pub const VIEWS_KEYSPACE: &str = "views";

/// Lifecycle of a view index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Never built; the index holds no rows.
    Unbuilt,
    /// An update pass is running.
    Building,
    /// Indexed through the store's latest sequence.
    UpToDate,
    /// Valid rows, but commits have landed past the checkpoint.
    Stale,
}

/// Fully ordered row address: collated key, then document ID, then the
/// position of the emit within that document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RowKey {
    pub key: CollationKey,
    pub doc_id: String,
    pub emit_index: u32,
}

/// One named view over a revision store.
///
/// The index maps emitted keys to values and is advanced incrementally:
/// each update pass re-maps only documents changed since the checkpoint,
/// replacing their previous rows. Rows and checkpoint persist atomically,
/// so a crash never leaves the index half-advanced.
pub struct View {
    key: String,
    def: ViewDef,
    store: Arc<RevisionStore>,
    rows: RwLock<BTreeMap<RowKey, Value>>,
    doc_rows: RwLock<HashMap<String, Vec<RowKey>>>,
    /// Sequence the index is valid through.
    checkpoint: AtomicU64,
    /// Serializes update passes; queries keep reading the old rows.
    update_lock: Mutex<()>,
    building: AtomicBool,
}

impl View {
    /// Opens a view, restoring persisted rows and checkpoint.
    pub(crate) fn open(
        store: Arc<RevisionStore>,
        key: impl Into<String>,
        def: ViewDef,
    ) -> EngineResult<Self> {
        let key = key.into();
        let checkpoint = match store
            .backend()
            .get(META_KEYSPACE, &checkpoint_key(&key))?
        {
            Some(raw) => serde_json::from_slice::<Sequence>(&raw)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?
                .as_u64(),
            None => 0,
        };

        let mut rows = BTreeMap::new();
        let mut doc_rows: HashMap<String, Vec<RowKey>> = HashMap::new();
        let prefix = doc_key(&key, "");
        for (record_key, raw) in store.backend().scan(VIEWS_KEYSPACE, &prefix)? {
            let doc_id = record_key[prefix.len()..].to_string();
            let emitted: Vec<(Value, Value)> = serde_json::from_slice(&raw)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?;
            let keys = insert_rows(&mut rows, &doc_id, emitted);
            doc_rows.insert(doc_id, keys);
        }

        Ok(Self {
            key,
            def,
            store,
            rows: RwLock::new(rows),
            doc_rows: RwLock::new(doc_rows),
            checkpoint: AtomicU64::new(checkpoint),
            update_lock: Mutex::new(()),
            building: AtomicBool::new(false),
        })
    }

    /// The view's `ddoc/name` key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Whether the view defines a reduce function.
    #[must_use]
    pub fn has_reduce(&self) -> bool {
        self.def.reduce.is_some()
    }

    pub(crate) fn definition(&self) -> &ViewDef {
        &self.def
    }

    pub(crate) fn store(&self) -> &RevisionStore {
        &self.store
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IndexState {
        if self.building.load(Ordering::SeqCst) {
            return IndexState::Building;
        }
        let checkpoint = self.checkpoint.load(Ordering::SeqCst);
        if checkpoint == 0 && self.rows.read().is_empty() {
            return IndexState::Unbuilt;
        }
        if checkpoint < self.store.last_sequence().as_u64() {
            IndexState::Stale
        } else {
            IndexState::UpToDate
        }
    }

    /// Sequence the index is valid through.
    #[must_use]
    pub fn checkpoint(&self) -> Sequence {
        Sequence::new(self.checkpoint.load(Ordering::SeqCst))
    }

    /// Number of rows currently indexed.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Advances the index through the store's latest committed sequence,
    /// re-mapping only documents changed since the checkpoint.
    pub fn update_index(&self) -> EngineResult<()> {
        let _guard = self.update_lock.lock();
        let checkpoint = Sequence::new(self.checkpoint.load(Ordering::SeqCst));
        let entries = self.store.sequence_log().since(checkpoint, None);
        let Some(new_checkpoint) = entries.last().map(|e| e.seq) else {
            return Ok(());
        };
        self.building.store(true, Ordering::SeqCst);
        let result = self.advance(&entries, new_checkpoint);
        self.building.store(false, Ordering::SeqCst);
        result
    }

    fn advance(
        &self,
        entries: &[crate::revision::ChangeEntry],
        new_checkpoint: Sequence,
    ) -> EngineResult<()> {
        // One pass per document even when several entries touch it.
        let mut touched: Vec<&str> = Vec::new();
        for entry in entries {
            if !touched.contains(&entry.doc_id.as_str()) {
                touched.push(&entry.doc_id);
            }
        }

        let mut batch = WriteBatch::new();
        let mut replacements: Vec<(String, Vec<(Value, Value)>)> = Vec::new();
        for doc_id in touched {
            let emitted = match self.store.winner(doc_id) {
                Some(winner) if !winner.deleted && winner.body.is_some() => {
                    (self.def.map)(&winner.properties())
                }
                _ => Vec::new(),
            };
            if emitted.is_empty() {
                batch.delete(VIEWS_KEYSPACE, &doc_key(&self.key, doc_id));
            } else {
                let raw = serde_json::to_vec(&emitted)
                    .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?;
                batch.put(VIEWS_KEYSPACE, &doc_key(&self.key, doc_id), raw);
            }
            replacements.push((doc_id.to_string(), emitted));
        }
        batch.put(
            META_KEYSPACE,
            &checkpoint_key(&self.key),
            serde_json::to_vec(&new_checkpoint)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?,
        );
        self.store.backend().apply(batch)?;

        let mut rows = self.rows.write();
        let mut doc_rows = self.doc_rows.write();
        for (doc_id, emitted) in replacements {
            if let Some(old) = doc_rows.remove(&doc_id) {
                for key in old {
                    rows.remove(&key);
                }
            }
            if !emitted.is_empty() {
                let keys = insert_rows(&mut rows, &doc_id, emitted);
                doc_rows.insert(doc_id, keys);
            }
        }
        self.checkpoint
            .store(new_checkpoint.as_u64(), Ordering::SeqCst);

        tracing::debug!(
            view = %self.key,
            checkpoint = new_checkpoint.as_u64(),
            rows = rows.len(),
            "view index advanced"
        );
        Ok(())
    }

    /// Drops a purged document's rows from the index.
    pub(crate) fn forget_doc(&self, doc_id: &str) -> EngineResult<()> {
        let _guard = self.update_lock.lock();
        let mut batch = WriteBatch::new();
        batch.delete(VIEWS_KEYSPACE, &doc_key(&self.key, doc_id));
        self.store.backend().apply(batch)?;

        let mut rows = self.rows.write();
        if let Some(old) = self.doc_rows.write().remove(doc_id) {
            for key in old {
                rows.remove(&key);
            }
        }
        Ok(())
    }

    pub(crate) fn with_rows<R>(
        &self,
        f: impl FnOnce(&BTreeMap<RowKey, Value>) -> R,
    ) -> R {
        f(&self.rows.read())
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("rows", &self.row_count())
            .finish_non_exhaustive()
    }
}

fn insert_rows(
    rows: &mut BTreeMap<RowKey, Value>,
    doc_id: &str,
    emitted: Vec<(Value, Value)>,
) -> Vec<RowKey> {
    let mut keys = Vec::with_capacity(emitted.len());
    for (emit_index, (key, value)) in emitted.into_iter().enumerate() {
        let row_key = RowKey {
            key: CollationKey(key),
            doc_id: doc_id.to_string(),
            emit_index: emit_index as u32,
        };
        keys.push(row_key.clone());
        rows.insert(row_key, value);
    }
    keys
}

fn doc_key(view: &str, doc_id: &str) -> String {
    format!("{view}/doc/{doc_id}")
}

fn checkpoint_key(view: &str) -> String {
    format!("view_checkpoint/{view}")
}
