//! Revision store: tree mutation, winner selection, history retrieval.

use crate::attachments::{present_attachments, stub_out_inline, AttachmentStore};
use crate::change_feed::CommitNotifier;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::registry::Registries;
use crate::revision::{ChangeEntry, Revision};
use crate::revtree::{RevNode, RevTree};
use crate::sequence::SequenceLog;
use crate::types::{generate_doc_id, is_valid_doc_id, Body, RevId, Sequence};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tidedb_storage::{StorageBackend, WriteBatch};

/// Keyspace holding one serialized [`RevTree`] per document.
pub const DOCS_KEYSPACE: &str = "docs";
/// Keyspace holding the by-sequence index of current leaves.
pub const CHANGES_KEYSPACE: &str = "changes";
/// Keyspace for store-wide metadata (last sequence, view checkpoints).
pub const META_KEYSPACE: &str = "meta";

const LAST_SEQ_KEY: &str = "last_seq";

fn seq_key(seq: Sequence) -> String {
    format!("{:020}", seq.as_u64())
}

/// A single document edit, staged by the bulk writer.
#[derive(Debug, Clone)]
pub enum DocEdit {
    /// A locally authored edit: a new revision ID will be generated.
    New {
        /// Document ID; generated when absent.
        doc_id: Option<String>,
        /// Content (control keys already stripped by the caller).
        body: Body,
        /// Tombstone flag.
        deleted: bool,
        /// Revision this edit claims to replace.
        parent: Option<RevId>,
        /// Accept the edit as a conflicting leaf on parent mismatch.
        allow_conflict: bool,
    },
    /// A replicated edit applied verbatim with its peer-assigned history.
    Forced {
        /// Document ID (must be well-formed).
        doc_id: String,
        /// The revision being inserted; must equal `history[0]`.
        rev_id: RevId,
        /// Ancestry, newest first.
        history: Vec<RevId>,
        /// Content.
        body: Body,
        /// Tombstone flag.
        deleted: bool,
    },
}

impl DocEdit {
    fn doc_id(&self) -> Option<&str> {
        match self {
            Self::New { doc_id, .. } => doc_id.as_deref(),
            Self::Forced { doc_id, .. } => Some(doc_id),
        }
    }
}

/// Per-document outcome of a staged commit.
#[derive(Debug)]
pub(crate) enum EditOutcome {
    /// Committed; carries the assigned revision and sequence.
    Written {
        /// Document ID (resolved, possibly generated).
        doc_id: String,
        /// Assigned or applied revision ID.
        rev_id: RevId,
        /// Assigned sequence; `None` when a forced edit consumed none
        /// (an idempotent re-apply or a placeholder back-fill).
        seq: Option<Sequence>,
    },
    /// Rejected with a per-document, bulk-recoverable error.
    Rejected {
        /// Document ID as requested.
        doc_id: String,
        /// The domain error (`Conflict` or `Forbidden`).
        error: EngineError,
    },
}

/// How an applied edit changed its scratch tree.
#[derive(Debug)]
enum TreeChange {
    /// A new leaf revision: consumes a sequence and feeds the change log.
    Leaf {
        rev_id: RevId,
        superseded: Vec<Sequence>,
    },
    /// A placeholder ancestor gained its content: the tree must be
    /// persisted, but no sequence is consumed and nothing reaches the
    /// feed (the ancestor was already superseded when its child arrived).
    Backfill { rev_id: RevId },
    /// The revision was already present with content: nothing changed.
    Unchanged { rev_id: RevId },
}

/// Options for [`RevisionStore::get_revision`] and
/// [`RevisionStore::get_document`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Embed `_revisions` ancestry.
    pub include_history: bool,
    /// Embed `_conflicts` (live non-winning leaves).
    pub include_conflicts: bool,
    /// Embed `_local_seq`.
    pub local_seq: bool,
    /// Inline attachment data instead of stubs.
    pub include_attachment_data: bool,
    /// Revisions the caller already has; attachments unchanged since the
    /// newest of these that is an ancestor are sent as stubs.
    pub atts_since: Vec<RevId>,
}

/// A row of an `_all_docs` listing.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AllDocsRow {
    /// Document ID.
    pub id: String,
    /// Winning revision.
    pub rev: RevId,
    /// Winning revision's properties, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Body>,
}

/// The revision store: owns every document's revision tree.
///
/// All mutations run under a single logical writer (one active write
/// transaction at a time); reads take a shared snapshot and may run
/// concurrently with a write, observing pre- or post-commit state but
/// never a partial write.
pub struct RevisionStore {
    backend: Arc<dyn StorageBackend>,
    config: Config,
    registries: Arc<Registries>,
    attachments: AttachmentStore,
    trees: RwLock<BTreeMap<String, RevTree>>,
    seq: SequenceLog,
    /// Serializes writers; commit notifications are sent after release.
    write_lock: Mutex<()>,
    notifier: CommitNotifier,
}

impl RevisionStore {
    /// Opens a store over a backend, replaying persisted state.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        config: Config,
        registries: Arc<Registries>,
    ) -> EngineResult<Self> {
        let mut trees = BTreeMap::new();
        for (doc_id, raw) in backend.scan(DOCS_KEYSPACE, "")? {
            let tree: RevTree = serde_json::from_slice(&raw).map_err(|e| {
                tidedb_storage::StorageError::corrupted(format!(
                    "revision tree for {doc_id:?}: {e}"
                ))
            })?;
            trees.insert(doc_id, tree);
        }

        let mut entries = Vec::new();
        for (key, raw) in backend.scan(CHANGES_KEYSPACE, "")? {
            let entry: ChangeEntry = serde_json::from_slice(&raw).map_err(|e| {
                tidedb_storage::StorageError::corrupted(format!("change entry {key}: {e}"))
            })?;
            entries.push(entry);
        }

        let last_seq = match backend.get(META_KEYSPACE, LAST_SEQ_KEY)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| {
                tidedb_storage::StorageError::corrupted(format!("last_seq: {e}"))
            })?,
            None => Sequence::new(0),
        };

        tracing::info!(
            docs = trees.len(),
            last_seq = last_seq.as_u64(),
            "revision store opened"
        );

        Ok(Self {
            attachments: AttachmentStore::new(Arc::clone(&backend)),
            backend,
            config,
            registries,
            trees: RwLock::new(trees),
            seq: SequenceLog::with_state(last_seq, entries),
            write_lock: Mutex::new(()),
            notifier: CommitNotifier::new(),
        })
    }

    /// The store's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The injected registries.
    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// The attachment blob store.
    #[must_use]
    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub(crate) fn sequence_log(&self) -> &SequenceLog {
        &self.seq
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub(crate) fn notifier(&self) -> &CommitNotifier {
        &self.notifier
    }

    /// The highest committed sequence.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.seq.last_sequence()
    }

    /// Number of documents whose winning revision is live.
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.trees
            .read()
            .values()
            .filter(|t| t.winner().is_some_and(|w| !w.deleted))
            .count()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Inserts a locally authored revision.
    ///
    /// Fails with `Conflict` if `parent` is not a current leaf (unless
    /// `allow_conflict`), and with `Forbidden` if a validation hook
    /// rejects the edit. A missing `doc_id` is generated. Commits
    /// atomically, assigning one sequence.
    pub fn insert(
        &self,
        doc_id: Option<String>,
        body: Body,
        deleted: bool,
        parent: Option<RevId>,
        allow_conflict: bool,
    ) -> EngineResult<Revision> {
        let edit = DocEdit::New {
            doc_id,
            body,
            deleted,
            parent,
            allow_conflict,
        };
        let outcome = self.commit_edits(vec![edit], true)?.pop();
        match outcome {
            Some(EditOutcome::Written {
                doc_id,
                rev_id,
                seq,
            }) => Ok(self
                .get_revision(&doc_id, Some(&rev_id), &GetOptions::default())
                .map(|mut r| {
                    r.sequence = seq;
                    r
                })?),
            Some(EditOutcome::Rejected { error, .. }) => Err(error),
            None => Err(EngineError::bad_request("empty edit batch")),
        }
    }

    /// Applies a peer's replicated revision verbatim.
    ///
    /// `history` is the revision's ancestry, newest first; its head must
    /// equal `rev_id`. Missing ancestors are inserted as bodiless
    /// placeholders. Conflicting leaves are recorded, never rejected.
    /// Re-applying an identical edit is a no-op.
    pub fn force_insert(
        &self,
        doc_id: &str,
        rev_id: RevId,
        history: Vec<RevId>,
        body: Body,
        deleted: bool,
    ) -> EngineResult<()> {
        let edit = DocEdit::Forced {
            doc_id: doc_id.to_string(),
            rev_id,
            history,
            body,
            deleted,
        };
        match self.commit_edits(vec![edit], true)?.pop() {
            Some(EditOutcome::Written { .. }) => Ok(()),
            Some(EditOutcome::Rejected { error, .. }) => Err(error),
            None => Err(EngineError::bad_request("empty edit batch")),
        }
    }

    /// Stages and commits a batch of edits as one storage transaction.
    ///
    /// Sequences are assigned contiguously in input order. Under
    /// `all_or_nothing`, the first per-document rejection aborts the whole
    /// batch (nothing commits, the sequence counter is untouched);
    /// otherwise rejections are recorded per document and the remainder
    /// commits. `BadRequest` and storage errors are always fatal.
    pub(crate) fn commit_edits(
        &self,
        edits: Vec<DocEdit>,
        all_or_nothing: bool,
    ) -> EngineResult<Vec<EditOutcome>> {
        let guard = self.write_lock.lock();

        let mut staged: BTreeMap<String, RevTree> = BTreeMap::new();
        let mut next_seq = self.seq.last_sequence().as_u64() + 1;
        let mut entries: Vec<ChangeEntry> = Vec::new();
        let mut superseded: Vec<Sequence> = Vec::new();
        let mut outcomes: Vec<EditOutcome> = Vec::new();

        {
            let trees = self.trees.read();
            for edit in edits {
                let doc_id = match edit.doc_id() {
                    Some(id) => id.to_string(),
                    None => generate_doc_id(),
                };
                if !is_valid_doc_id(&doc_id) {
                    return Err(EngineError::bad_request(format!(
                        "invalid document id {doc_id:?}"
                    )));
                }

                // Apply to a scratch copy so a rejected edit leaves the
                // staged tree for this document untouched.
                let base = staged
                    .get(&doc_id)
                    .or_else(|| trees.get(&doc_id))
                    .cloned()
                    .unwrap_or_default();
                let mut scratch = base;

                let seq = Sequence::new(next_seq);
                let applied = match edit {
                    DocEdit::New {
                        body,
                        deleted,
                        parent,
                        allow_conflict,
                        ..
                    } => self
                        .apply_new_edit(
                            &doc_id,
                            &mut scratch,
                            body,
                            deleted,
                            parent,
                            allow_conflict,
                            seq,
                        )
                        .map(|(rev_id, superseded)| TreeChange::Leaf {
                            rev_id,
                            superseded,
                        }),
                    DocEdit::Forced {
                        rev_id,
                        history,
                        body,
                        deleted,
                        ..
                    } => self.apply_forced_edit(
                        &doc_id,
                        &mut scratch,
                        rev_id,
                        history,
                        body,
                        deleted,
                        seq,
                    ),
                };

                match applied {
                    Ok(TreeChange::Leaf {
                        rev_id,
                        superseded: doc_superseded,
                    }) => {
                        next_seq += 1;
                        superseded.extend(doc_superseded);
                        entries.push(ChangeEntry {
                            seq,
                            doc_id: doc_id.clone(),
                            rev_id: rev_id.clone(),
                            deleted: scratch
                                .get(&rev_id)
                                .is_some_and(|n| n.deleted),
                        });
                        staged.insert(doc_id.clone(), scratch);
                        outcomes.push(EditOutcome::Written {
                            doc_id,
                            rev_id,
                            seq: Some(seq),
                        });
                    }
                    Ok(TreeChange::Backfill { rev_id }) => {
                        // The tree gained content but no new leaf: persist
                        // it without a sequence or feed entry.
                        staged.insert(doc_id.clone(), scratch);
                        outcomes.push(EditOutcome::Written {
                            doc_id,
                            rev_id,
                            seq: None,
                        });
                    }
                    Ok(TreeChange::Unchanged { rev_id }) => {
                        outcomes.push(EditOutcome::Written {
                            doc_id,
                            rev_id,
                            seq: None,
                        });
                    }
                    Err(e) if e.is_recoverable_in_bulk() => {
                        if all_or_nothing {
                            return Err(e);
                        }
                        outcomes.push(EditOutcome::Rejected { doc_id, error: e });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Entries superseded within the same batch never hit the index.
        let superseded_set: HashSet<u64> =
            superseded.iter().map(|s| s.as_u64()).collect();
        entries.retain(|e| !superseded_set.contains(&e.seq.as_u64()));

        if staged.is_empty() {
            return Ok(outcomes);
        }

        let mut batch = WriteBatch::new();
        for (doc_id, tree) in &staged {
            let raw = serde_json::to_vec(tree)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?;
            batch.put(DOCS_KEYSPACE, doc_id, raw);
        }
        for seq in &superseded {
            batch.delete(CHANGES_KEYSPACE, &seq_key(*seq));
        }
        for entry in &entries {
            let raw = serde_json::to_vec(entry)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?;
            batch.put(CHANGES_KEYSPACE, &seq_key(entry.seq), raw);
        }
        let last = Sequence::new(next_seq - 1);
        batch.put(
            META_KEYSPACE,
            LAST_SEQ_KEY,
            serde_json::to_vec(&last)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?,
        );

        self.backend.apply(batch)?;
        if self.config.sync_on_commit {
            self.backend.sync()?;
        }

        {
            let mut trees = self.trees.write();
            for (doc_id, tree) in staged {
                trees.insert(doc_id, tree);
            }
        }
        self.seq.commit(entries.clone(), superseded);

        tracing::debug!(
            changes = entries.len(),
            last_seq = last.as_u64(),
            "committed edit batch"
        );

        // Observers run after the writer releases its lock.
        drop(guard);
        self.notifier.notify(&entries);

        Ok(outcomes)
    }

    fn apply_new_edit(
        &self,
        doc_id: &str,
        tree: &mut RevTree,
        mut body: Body,
        deleted: bool,
        parent: Option<RevId>,
        allow_conflict: bool,
        seq: Sequence,
    ) -> EngineResult<(RevId, Vec<Sequence>)> {
        let winner = tree.winner().cloned();

        let parent = match parent {
            Some(p) => {
                // Any current leaf is a valid parent; that is how losing
                // branches get resolved. A parent with a child is stale.
                let Some(node) = tree.get(&p) else {
                    return Err(EngineError::conflict(doc_id));
                };
                if tree.has_child(&node.rev_id) && !allow_conflict {
                    return Err(EngineError::conflict(doc_id));
                }
                Some(p)
            }
            None => match &winner {
                // Editing a deleted document revives it from the tombstone.
                Some(w) if w.deleted => Some(w.rev_id.clone()),
                Some(w) => {
                    if !allow_conflict {
                        return Err(EngineError::conflict(doc_id));
                    }
                    tracing::debug!(doc_id, winner = %w.rev_id, "accepting conflicting root");
                    None
                }
                None => None,
            },
        };

        strip_control_keys(&mut body);
        let generation = parent.as_ref().map_or(1, |p| p.generation() + 1);
        stub_out_inline(&mut body, generation, &self.attachments)?;

        let rev_id = RevId::derive(parent.as_ref(), deleted, &body);
        if tree.contains(&rev_id) {
            // Identical edit already retained.
            return Err(EngineError::conflict(doc_id));
        }

        let candidate = Revision::new(doc_id, rev_id.clone(), deleted, Some(body.clone()), None);
        let prev = parent.as_ref().and_then(|p| tree.get(p)).map(|n| {
            Revision::new(doc_id, n.rev_id.clone(), n.deleted, n.body.clone(), n.sequence)
        });
        self.run_validators(&candidate, prev.as_ref())?;

        let mut superseded = Vec::new();
        if let Some(p) = &parent {
            if let Some(node) = tree.get(p) {
                if !tree.has_child(p) {
                    if let Some(parent_seq) = node.sequence {
                        superseded.push(parent_seq);
                    }
                }
            }
        }

        tree.add(
            RevNode {
                rev_id: rev_id.clone(),
                parent,
                deleted,
                body: Some(body),
                sequence: Some(seq),
            },
            false,
        )?;
        tree.prune(self.config.max_rev_tree_depth);

        Ok((rev_id, superseded))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_forced_edit(
        &self,
        doc_id: &str,
        tree: &mut RevTree,
        rev_id: RevId,
        history: Vec<RevId>,
        mut body: Body,
        deleted: bool,
        seq: Sequence,
    ) -> EngineResult<TreeChange> {
        if history.first() != Some(&rev_id) {
            return Err(EngineError::bad_request(format!(
                "revision history head does not match {rev_id}"
            )));
        }

        if let Some(existing) = tree.get(&rev_id) {
            if !existing.is_placeholder() {
                // Already applied: idempotent.
                return Ok(TreeChange::Unchanged { rev_id });
            }
        }

        strip_control_keys(&mut body);
        stub_out_inline(&mut body, rev_id.generation(), &self.attachments)?;

        let parent = history.get(1).cloned();
        let candidate =
            Revision::new(doc_id, rev_id.clone(), deleted, Some(body.clone()), None);
        let prev = parent.as_ref().and_then(|p| tree.get(p)).map(|n| {
            Revision::new(doc_id, n.rev_id.clone(), n.deleted, n.body.clone(), n.sequence)
        });
        self.run_validators(&candidate, prev.as_ref())?;

        // Walk ancestry oldest-first, filling gaps with placeholders so
        // the tree stays internally consistent. The oldest entry may be an
        // orphan root awaiting earlier history.
        let mut older: Option<RevId> = None;
        for ancestor in history.iter().skip(1).rev() {
            if !tree.contains(ancestor) {
                tree.add(
                    RevNode {
                        rev_id: ancestor.clone(),
                        parent: older.clone(),
                        deleted: false,
                        body: None,
                        sequence: None,
                    },
                    true,
                )?;
            }
            older = Some(ancestor.clone());
        }

        let mut superseded = Vec::new();
        if let Some(p) = &parent {
            if let Some(node) = tree.get(p) {
                if !tree.has_child(p) {
                    if let Some(parent_seq) = node.sequence {
                        superseded.push(parent_seq);
                    }
                }
            }
        }

        if let Some(existing) = tree.get(&rev_id) {
            // Placeholder gaining its real content.
            let mut node = existing.clone();
            node.body = Some(body);
            node.deleted = deleted;
            if tree.has_child(&rev_id) {
                // Interior placeholder: fill the body, no feed entry.
                tree.update(node);
                return Ok(TreeChange::Backfill { rev_id });
            }
            node.sequence = Some(seq);
            tree.update(node);
        } else {
            tree.add(
                RevNode {
                    rev_id: rev_id.clone(),
                    parent,
                    deleted,
                    body: Some(body),
                    sequence: Some(seq),
                },
                true,
            )?;
        }

        if tree.is_conflicted() {
            tracing::debug!(doc_id, rev = %rev_id, "replicated edit created conflicting leaves");
        }
        tree.prune(self.config.max_rev_tree_depth);

        Ok(TreeChange::Leaf { rev_id, superseded })
    }

    fn run_validators(
        &self,
        candidate: &Revision,
        prev: Option<&Revision>,
    ) -> EngineResult<()> {
        for validator in self.registries.validators() {
            if let Err(reason) = validator(candidate, prev) {
                return Err(EngineError::Forbidden(reason));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetches a revision; the winner when `rev_id` is `None`.
    ///
    /// Returns `NotFound` for unknown documents, unknown revisions,
    /// placeholder ancestors whose content was never replicated, and
    /// (when asking for the winner) documents whose winner is deleted.
    pub fn get_revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
        _opts: &GetOptions,
    ) -> EngineResult<Revision> {
        let trees = self.trees.read();
        let tree = trees
            .get(doc_id)
            .ok_or_else(|| EngineError::not_found(format!("document {doc_id:?}")))?;

        let node = match rev_id {
            Some(rev) => tree
                .get(rev)
                .ok_or_else(|| EngineError::not_found(format!("revision {rev}")))?,
            None => {
                let winner = tree
                    .winner()
                    .ok_or_else(|| EngineError::not_found(format!("document {doc_id:?}")))?;
                if winner.deleted {
                    return Err(EngineError::not_found(format!(
                        "document {doc_id:?} is deleted"
                    )));
                }
                winner
            }
        };
        if node.is_placeholder() {
            return Err(EngineError::not_found(format!(
                "revision {} is not stored",
                node.rev_id
            )));
        }

        Ok(Revision::new(
            doc_id,
            node.rev_id.clone(),
            node.deleted,
            node.body.clone(),
            node.sequence,
        ))
    }

    /// Fetches a revision as wire-shaped properties, honoring the read
    /// options (`_revisions`, `_conflicts`, `_local_seq`, attachment
    /// presentation).
    pub fn get_document(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
        opts: &GetOptions,
    ) -> EngineResult<Body> {
        let revision = self.get_revision(doc_id, rev_id, opts)?;
        let mut props = revision.properties();

        let inline_after = if !opts.atts_since.is_empty() {
            let ancestor =
                self.find_common_ancestor(doc_id, &revision.rev_id, &opts.atts_since)?;
            Some(ancestor.map_or(0, |a| a.generation()))
        } else if opts.include_attachment_data {
            Some(0)
        } else {
            None
        };
        present_attachments(&mut props, inline_after, &self.attachments)?;

        let trees = self.trees.read();
        let tree = trees
            .get(doc_id)
            .ok_or_else(|| EngineError::not_found(format!("document {doc_id:?}")))?;

        if opts.include_history {
            let chain = tree.history(&revision.rev_id);
            let start = chain.first().map_or(0, RevId::generation);
            let ids: Vec<Value> = chain
                .iter()
                .map(|r| Value::String(r.digest().to_string()))
                .collect();
            let mut revisions = Body::new();
            revisions.insert("start".into(), Value::from(start));
            revisions.insert("ids".into(), Value::Array(ids));
            props.insert("_revisions".into(), Value::Object(revisions));
        }

        if opts.include_conflicts {
            let conflicts: Vec<Value> = tree
                .conflicts()
                .iter()
                .filter(|r| **r != revision.rev_id)
                .map(|r| Value::String(r.to_string()))
                .collect();
            if !conflicts.is_empty() {
                props.insert("_conflicts".into(), Value::Array(conflicts));
            }
        }

        if opts.local_seq {
            if let Some(seq) = revision.sequence {
                props.insert("_local_seq".into(), Value::from(seq.as_u64()));
            }
        }

        Ok(props)
    }

    /// All leaves of a document, winner first, optionally including
    /// tombstoned leaves. Used for `?open_revs=all` retrieval and
    /// conflict-resolution tooling.
    pub fn get_all_leaves(
        &self,
        doc_id: &str,
        include_deleted: bool,
    ) -> EngineResult<Vec<Revision>> {
        let trees = self.trees.read();
        let tree = trees
            .get(doc_id)
            .ok_or_else(|| EngineError::not_found(format!("document {doc_id:?}")))?;
        Ok(tree
            .leaves()
            .into_iter()
            .filter(|n| include_deleted || !n.deleted)
            .filter(|n| !n.is_placeholder())
            .map(|n| {
                Revision::new(doc_id, n.rev_id.clone(), n.deleted, n.body.clone(), n.sequence)
            })
            .collect())
    }

    /// The newest of `candidates` that is an ancestor of `rev_id` in the
    /// document's retained history, or `None`.
    pub fn find_common_ancestor(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        candidates: &[RevId],
    ) -> EngineResult<Option<RevId>> {
        let trees = self.trees.read();
        let tree = trees
            .get(doc_id)
            .ok_or_else(|| EngineError::not_found(format!("document {doc_id:?}")))?;
        // History is newest-first, so the first hit is the newest.
        Ok(tree
            .history(rev_id)
            .into_iter()
            .find(|r| candidates.contains(r)))
    }

    /// The winning revision of a document, tombstone included, if any
    /// revision is retained.
    #[must_use]
    pub fn winner(&self, doc_id: &str) -> Option<Revision> {
        let trees = self.trees.read();
        let tree = trees.get(doc_id)?;
        let node = tree.winner()?;
        Some(Revision::new(
            doc_id,
            node.rev_id.clone(),
            node.deleted,
            node.body.clone(),
            node.sequence,
        ))
    }

    /// Lists live documents in ID order.
    pub fn all_docs(&self, include_docs: bool) -> EngineResult<Vec<AllDocsRow>> {
        let trees = self.trees.read();
        let mut rows = Vec::new();
        for (doc_id, tree) in trees.iter() {
            let Some(winner) = tree.winner() else { continue };
            if winner.deleted {
                continue;
            }
            let doc = if include_docs {
                let rev = Revision::new(
                    doc_id,
                    winner.rev_id.clone(),
                    false,
                    winner.body.clone(),
                    winner.sequence,
                );
                Some(rev.properties())
            } else {
                None
            };
            rows.push(AllDocsRow {
                id: doc_id.clone(),
                rev: winner.rev_id.clone(),
                doc,
            });
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Removes a document's entire revision tree. Unlike deletion this
    /// leaves no tombstone and no change-feed entry; the sequence counter
    /// never rewinds.
    pub fn purge(&self, doc_id: &str) -> EngineResult<()> {
        let _guard = self.write_lock.lock();

        let removed_seqs: Vec<Sequence> = self
            .seq
            .all()
            .into_iter()
            .filter(|e| e.doc_id == doc_id)
            .map(|e| e.seq)
            .collect();

        {
            let trees = self.trees.read();
            if !trees.contains_key(doc_id) {
                return Err(EngineError::not_found(format!("document {doc_id:?}")));
            }
        }

        let mut batch = WriteBatch::new();
        batch.delete(DOCS_KEYSPACE, doc_id);
        for seq in &removed_seqs {
            batch.delete(CHANGES_KEYSPACE, &seq_key(*seq));
        }
        self.backend.apply(batch)?;

        self.trees.write().remove(doc_id);
        self.seq.remove_doc(doc_id);
        tracing::info!(doc_id, "purged document");
        Ok(())
    }

    /// Prunes every tree to the configured depth and drops the bodies of
    /// interior revisions, keeping tree shape (and therefore revs-diff
    /// answers) intact.
    pub fn compact(&self) -> EngineResult<usize> {
        let _guard = self.write_lock.lock();
        let mut pruned = 0;

        let mut trees = self.trees.write();
        let mut batch = WriteBatch::new();
        for (doc_id, tree) in trees.iter_mut() {
            let before = tree.len();
            tree.prune(self.config.max_rev_tree_depth);
            let leaf_ids: HashSet<String> = tree
                .leaves()
                .iter()
                .map(|n| n.rev_id.to_string())
                .collect();
            let interior: Vec<RevNode> = tree
                .rev_ids()
                .filter(|n| !leaf_ids.contains(&n.rev_id.to_string()) && n.body.is_some())
                .cloned()
                .collect();
            for mut node in interior {
                node.body = None;
                tree.update(node);
                pruned += 1;
            }
            pruned += before - tree.len();

            let raw = serde_json::to_vec(&*tree)
                .map_err(|e| tidedb_storage::StorageError::corrupted(e.to_string()))?;
            batch.put(DOCS_KEYSPACE, doc_id, raw);
        }
        self.backend.apply(batch)?;
        tracing::info!(revisions = pruned, "compacted revision store");
        Ok(pruned)
    }

    pub(crate) fn with_trees<R>(&self, f: impl FnOnce(&BTreeMap<String, RevTree>) -> R) -> R {
        f(&self.trees.read())
    }
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("doc_count", &self.doc_count())
            .field("last_sequence", &self.last_sequence())
            .finish_non_exhaustive()
    }
}

/// Removes reserved underscore-prefixed keys from a body before storage.
/// `_attachments` survives: it is real (processed) document state.
fn strip_control_keys(body: &mut Body) {
    body.retain(|key, _| !key.starts_with('_') || key == "_attachments");
}
