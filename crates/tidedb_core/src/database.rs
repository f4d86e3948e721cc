//! The database facade: one handle owning a revision store and its views.

use crate::bulk::{BulkOptions, BulkRow};
use crate::change_feed::{ChangesOptions, ChangesResult, ChangesSubscription};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::registry::Registries;
use crate::revision::Revision;
use crate::revs_diff::DocDiff;
use crate::store::{AllDocsRow, GetOptions, RevisionStore};
use crate::types::{Body, RevId, Sequence};
use crate::view::{QueryOptions, QueryResult, View};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidedb_storage::{FileBackend, MemoryBackend, StorageBackend};

/// Summary of a database, as peers see it when negotiating replication.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DatabaseInfo {
    /// Name the database was opened under.
    pub db_name: String,
    /// Number of live documents.
    pub doc_count: usize,
    /// Highest committed sequence.
    pub update_seq: Sequence,
}

/// A multi-version document database.
///
/// One `Database` owns one revision store plus the view indexes built
/// from its registered view definitions. The handle is `Send + Sync`;
/// writes serialize internally, reads run concurrently.
pub struct Database {
    name: String,
    store: Arc<RevisionStore>,
    views: BTreeMap<String, Arc<View>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens (or creates) a file-backed database at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        config: Config,
        registries: Registries,
    ) -> EngineResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map_or_else(|| "db".to_string(), |s| s.to_string_lossy().into_owned());
        let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(path)?);
        Self::with_backend(name, backend, config, registries)
    }

    /// Opens a memory-backed database, for tests and caches.
    pub fn open_in_memory(config: Config, registries: Registries) -> EngineResult<Self> {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        Self::with_backend("in-memory", backend, config, registries)
    }

    /// Opens a database over an arbitrary backend.
    pub fn with_backend(
        name: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        config: Config,
        registries: Registries,
    ) -> EngineResult<Self> {
        let registries = Arc::new(registries);
        let store = Arc::new(RevisionStore::open(
            backend,
            config,
            Arc::clone(&registries),
        )?);

        let mut views = BTreeMap::new();
        for key in registries.view_names() {
            let Some((ddoc, view_name)) = key.split_once('/') else {
                continue;
            };
            let Some(def) = registries.get_view(ddoc, view_name) else {
                continue;
            };
            let view = View::open(Arc::clone(&store), key.clone(), def.clone())?;
            views.insert(key, Arc::new(view));
        }

        Ok(Self {
            name: name.into(),
            store,
            views,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::DatabaseClosed);
        }
        Ok(())
    }

    /// The name this database was opened under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opening configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        self.store.config()
    }

    /// Summary info: name, live document count, update sequence.
    pub fn info(&self) -> EngineResult<DatabaseInfo> {
        self.ensure_open()?;
        Ok(DatabaseInfo {
            db_name: self.name.clone(),
            doc_count: self.store.doc_count(),
            update_seq: self.store.last_sequence(),
        })
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> EngineResult<usize> {
        self.ensure_open()?;
        Ok(self.store.doc_count())
    }

    /// Highest committed sequence.
    pub fn last_sequence(&self) -> EngineResult<Sequence> {
        self.ensure_open()?;
        Ok(self.store.last_sequence())
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Writes a document revision. `parent` must name a current leaf (or
    /// be `None` for a new document); a stale parent conflicts.
    pub fn put_document(
        &self,
        doc_id: Option<String>,
        body: Body,
        parent: Option<RevId>,
    ) -> EngineResult<Revision> {
        self.ensure_open()?;
        self.store.insert(doc_id, body, false, parent, false)
    }

    /// Writes a deletion tombstone on top of `parent`.
    pub fn delete_document(&self, doc_id: &str, parent: RevId) -> EngineResult<Revision> {
        self.ensure_open()?;
        self.store
            .insert(Some(doc_id.to_string()), Body::new(), true, Some(parent), false)
    }

    /// Applies a replicated revision with its peer-assigned history
    /// (newest first, head equal to `rev_id`).
    pub fn force_insert(
        &self,
        doc_id: &str,
        rev_id: RevId,
        history: Vec<RevId>,
        body: Body,
        deleted: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        self.store.force_insert(doc_id, rev_id, history, body, deleted)
    }

    /// Fetches a revision; the current winner when `rev_id` is `None`.
    pub fn get_revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
        opts: &GetOptions,
    ) -> EngineResult<Revision> {
        self.ensure_open()?;
        self.store.get_revision(doc_id, rev_id, opts)
    }

    /// Fetches a revision as wire-shaped properties.
    pub fn get_document(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
        opts: &GetOptions,
    ) -> EngineResult<Body> {
        self.ensure_open()?;
        self.store.get_document(doc_id, rev_id, opts)
    }

    /// All leaves of a document, winner first.
    pub fn get_all_leaves(
        &self,
        doc_id: &str,
        include_deleted: bool,
    ) -> EngineResult<Vec<Revision>> {
        self.ensure_open()?;
        self.store.get_all_leaves(doc_id, include_deleted)
    }

    /// Lists live documents in ID order.
    pub fn all_docs(&self, include_docs: bool) -> EngineResult<Vec<AllDocsRow>> {
        self.ensure_open()?;
        self.store.all_docs(include_docs)
    }

    /// Writes a batch of documents in one atomic commit.
    pub fn apply_bulk(
        &self,
        docs: Vec<Value>,
        opts: &BulkOptions,
    ) -> EngineResult<Vec<BulkRow>> {
        self.ensure_open()?;
        self.store.apply_bulk(docs, opts)
    }

    // ------------------------------------------------------------------
    // Replication surface
    // ------------------------------------------------------------------

    /// The `normal` change feed.
    pub fn changes_since(&self, opts: &ChangesOptions) -> EngineResult<ChangesResult> {
        self.ensure_open()?;
        self.store.changes_since(opts)
    }

    /// The `longpoll` change feed. `timeout` of `None` uses the
    /// configured default.
    pub fn changes_longpoll(
        &self,
        opts: &ChangesOptions,
        timeout: Option<Duration>,
    ) -> EngineResult<ChangesResult> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.store.config().longpoll_timeout);
        self.store.changes_longpoll(opts, timeout)
    }

    /// The `continuous` change feed: a live subscription.
    pub fn changes_continuous(
        &self,
        opts: ChangesOptions,
    ) -> EngineResult<ChangesSubscription<'_>> {
        self.ensure_open()?;
        self.store.changes_continuous(opts)
    }

    /// Which of a peer's revisions this database lacks.
    pub fn revs_diff(
        &self,
        request: &BTreeMap<String, Vec<RevId>>,
    ) -> EngineResult<BTreeMap<String, DocDiff>> {
        self.ensure_open()?;
        Ok(self.store.revs_diff(request))
    }

    /// The newest of `candidates` that is an ancestor of `rev_id`.
    pub fn find_common_ancestor(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        candidates: &[RevId],
    ) -> EngineResult<Option<RevId>> {
        self.ensure_open()?;
        self.store.find_common_ancestor(doc_id, rev_id, candidates)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Looks up a registered view.
    pub fn view(&self, ddoc: &str, name: &str) -> EngineResult<Arc<View>> {
        self.ensure_open()?;
        self.views
            .get(&format!("{ddoc}/{name}"))
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("view {ddoc}/{name}")))
    }

    /// Queries a registered view.
    pub fn query_view(
        &self,
        ddoc: &str,
        name: &str,
        opts: &QueryOptions,
    ) -> EngineResult<QueryResult> {
        self.view(ddoc, name)?.query(opts)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Removes a document's entire revision tree and its view rows,
    /// leaving no tombstone and no change-feed entry.
    pub fn purge(&self, doc_id: &str) -> EngineResult<()> {
        self.ensure_open()?;
        self.store.purge(doc_id)?;
        for view in self.views.values() {
            view.forget_doc(doc_id)?;
        }
        Ok(())
    }

    /// Prunes revision history and drops interior revision bodies.
    pub fn compact(&self) -> EngineResult<usize> {
        self.ensure_open()?;
        self.store.compact()
    }

    /// Flushes the backend and marks the handle closed. Further calls
    /// fail with [`EngineError::DatabaseClosed`]. Idempotent.
    pub fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.backend().sync()?;
        tracing::info!(db = %self.name, "database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(db = %self.name, error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("views", &self.views.keys().collect::<Vec<_>>())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: serde_json::Value) -> Body {
        v.as_object().unwrap().clone()
    }

    fn open_db() -> Database {
        Database::open_in_memory(Config::default(), Registries::new()).unwrap()
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let db = open_db();
        let rev = db
            .put_document(Some("doc".into()), body(json!({"x": 1})), None)
            .unwrap();
        let fetched = db
            .get_document("doc", None, &GetOptions::default())
            .unwrap();
        assert_eq!(fetched["x"], 1);
        assert_eq!(fetched["_rev"], rev.rev_id.to_string());

        let tomb = db.delete_document("doc", rev.rev_id).unwrap();
        assert!(tomb.deleted);
        assert!(db.get_document("doc", None, &GetOptions::default()).is_err());
    }

    #[test]
    fn info_reflects_state() {
        let db = open_db();
        db.put_document(Some("a".into()), body(json!({})), None)
            .unwrap();
        let info = db.info().unwrap();
        assert_eq!(info.db_name, "in-memory");
        assert_eq!(info.doc_count, 1);
        assert_eq!(info.update_seq, Sequence::new(1));
    }

    #[test]
    fn closed_database_rejects_calls() {
        let db = open_db();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.put_document(None, Body::new(), None),
            Err(EngineError::DatabaseClosed)
        ));
        assert!(matches!(db.info(), Err(EngineError::DatabaseClosed)));
    }

    #[test]
    fn file_backed_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.tide");

        {
            let db = Database::open(&path, Config::default(), Registries::new()).unwrap();
            assert_eq!(db.name(), "orders");
            db.put_document(Some("doc".into()), body(json!({"n": 1})), None)
                .unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&path, Config::default(), Registries::new()).unwrap();
        assert_eq!(db.doc_count().unwrap(), 1);
        let doc = db.get_document("doc", None, &GetOptions::default()).unwrap();
        assert_eq!(doc["n"], 1);
    }

    #[test]
    fn purge_also_cleans_views() {
        let registries = Registries::new().view(
            "d",
            "by_x",
            Arc::new(|doc: &Body| {
                doc.get("x").map(|x| vec![(x.clone(), Value::Null)]).unwrap_or_default()
            }),
            None,
        );
        let db = Database::open_in_memory(Config::default(), registries).unwrap();
        db.put_document(Some("doc".into()), body(json!({"x": 1})), None)
            .unwrap();
        let result = db.query_view("d", "by_x", &QueryOptions::default()).unwrap();
        assert_eq!(result.rows.len(), 1);

        db.purge("doc").unwrap();
        let result = db.query_view("d", "by_x", &QueryOptions::default()).unwrap();
        assert!(result.rows.is_empty());
    }

    #[test]
    fn unknown_view_is_not_found() {
        let db = open_db();
        assert!(matches!(
            db.query_view("d", "missing", &QueryOptions::default()),
            Err(EngineError::NotFound(_))
        ));
    }
}
