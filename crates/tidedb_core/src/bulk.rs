//! Bulk document writes: many edits, one atomic commit.

use crate::error::{EngineError, EngineResult};
use crate::store::{DocEdit, EditOutcome, RevisionStore};
use crate::types::RevId;
use serde_json::Value;

/// Modes of a bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOptions {
    /// When true (the default), each document is a locally authored edit
    /// and gets a freshly generated revision ID. When false, documents
    /// carry replicated revision histories applied verbatim.
    pub new_edits: bool,
    /// When true, any per-document rejection aborts the whole batch.
    /// Otherwise rejections are reported per row and the rest commits.
    pub all_or_nothing: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            new_edits: true,
            all_or_nothing: false,
        }
    }
}

/// Per-document outcome of a bulk write, in input order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BulkRow {
    /// Document ID (generated when the input had none).
    pub id: String,
    /// Committed revision, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<RevId>,
    /// `true` on success; omitted on rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Error kind (`conflict`, `forbidden`), on rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkRow {
    fn written(id: String, rev: RevId) -> Self {
        Self {
            id,
            rev: Some(rev),
            ok: Some(true),
            error: None,
            reason: None,
        }
    }

    fn rejected(id: String, error: &EngineError) -> Self {
        Self {
            id,
            rev: None,
            ok: None,
            error: Some(error.kind().to_string()),
            reason: Some(error.to_string()),
        }
    }

    /// Returns true if the document committed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.ok == Some(true)
    }
}

impl RevisionStore {
    /// Writes a batch of documents in one atomic commit.
    ///
    /// Each element of `docs` is a document body that may carry `_id`,
    /// `_rev`, `_deleted`, and (with `new_edits == false`) `_revisions`
    /// control fields. Sequences are assigned contiguously in input
    /// order; rejected documents consume none.
    ///
    /// # Errors
    ///
    /// `BadRequest` for malformed input (always fatal to the batch), and
    /// under `all_or_nothing` the first `Conflict` or `Forbidden`.
    pub fn apply_bulk(
        &self,
        docs: Vec<Value>,
        opts: &BulkOptions,
    ) -> EngineResult<Vec<BulkRow>> {
        let mut edits = Vec::with_capacity(docs.len());
        for doc in docs {
            edits.push(parse_edit(doc, opts.new_edits)?);
        }

        let outcomes = self.commit_edits(edits, opts.all_or_nothing)?;
        Ok(outcomes
            .into_iter()
            .map(|outcome| match outcome {
                EditOutcome::Written { doc_id, rev_id, .. } => {
                    BulkRow::written(doc_id, rev_id)
                }
                EditOutcome::Rejected { doc_id, error } => {
                    BulkRow::rejected(doc_id, &error)
                }
            })
            .collect())
    }
}

/// Interprets one bulk document as an edit, separating control fields
/// from content.
fn parse_edit(doc: Value, new_edits: bool) -> EngineResult<DocEdit> {
    let Value::Object(body) = doc else {
        return Err(EngineError::bad_request("bulk document must be an object"));
    };

    let doc_id = match body.get("_id") {
        None => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => return Err(EngineError::bad_request("_id must be a string")),
    };
    let deleted = match body.get("_deleted") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(EngineError::bad_request("_deleted must be a boolean")),
    };
    let rev = match body.get("_rev") {
        None => None,
        Some(Value::String(s)) => Some(RevId::parse(s)?),
        Some(_) => return Err(EngineError::bad_request("_rev must be a string")),
    };

    if new_edits {
        return Ok(DocEdit::New {
            doc_id,
            body,
            deleted,
            parent: rev,
            allow_conflict: false,
        });
    }

    let doc_id = doc_id
        .ok_or_else(|| EngineError::bad_request("replicated document requires _id"))?;
    let history = match body.get("_revisions") {
        Some(value) => parse_revisions(value)?,
        None => match &rev {
            Some(rev) => vec![rev.clone()],
            None => {
                return Err(EngineError::bad_request(
                    "replicated document requires _rev or _revisions",
                ))
            }
        },
    };
    let rev_id = history
        .first()
        .cloned()
        .ok_or_else(|| EngineError::bad_request("_revisions must not be empty"))?;
    if let Some(rev) = rev {
        if rev != rev_id {
            return Err(EngineError::bad_request(
                "_rev does not match the head of _revisions",
            ));
        }
    }

    Ok(DocEdit::Forced {
        doc_id,
        rev_id,
        history,
        body,
        deleted,
    })
}

/// Decodes the `_revisions` field: `{"start": N, "ids": [...]}` where
/// `ids[0]` has generation `start` and each following entry one less.
fn parse_revisions(value: &Value) -> EngineResult<Vec<RevId>> {
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::bad_request("_revisions must be an object"))?;
    let start = obj
        .get("start")
        .and_then(Value::as_u64)
        .ok_or_else(|| EngineError::bad_request("_revisions.start must be a number"))?;
    let ids = obj
        .get("ids")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::bad_request("_revisions.ids must be an array"))?;
    if ids.is_empty() || (start as usize) < ids.len() {
        return Err(EngineError::bad_request("_revisions is inconsistent"));
    }

    let mut history = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let digest = id
            .as_str()
            .ok_or_else(|| EngineError::bad_request("_revisions.ids must be strings"))?;
        history.push(RevId::new(start - i as u64, digest)?);
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::Registries;
    use crate::store::GetOptions;
    use crate::types::Sequence;
    use serde_json::json;
    use std::sync::Arc;
    use tidedb_storage::MemoryBackend;

    fn open_store() -> RevisionStore {
        RevisionStore::open(
            Arc::new(MemoryBackend::new()),
            Config::default(),
            Arc::new(Registries::new()),
        )
        .unwrap()
    }

    #[test]
    fn batch_commits_in_input_order() {
        let store = open_store();
        let rows = store
            .apply_bulk(
                vec![
                    json!({"_id": "a", "v": 1}),
                    json!({"_id": "b", "v": 2}),
                    json!({"_id": "c", "v": 3}),
                ],
                &BulkOptions::default(),
            )
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(BulkRow::is_ok));
        // Contiguous sequences in input order.
        let feed = store
            .changes_since(&crate::change_feed::ChangesOptions::default())
            .unwrap();
        let ids: Vec<&str> = feed.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.last_sequence(), Sequence::new(3));
    }

    #[test]
    fn best_effort_reports_conflicts_per_row() {
        let store = open_store();
        store
            .apply_bulk(vec![json!({"_id": "a", "v": 1})], &BulkOptions::default())
            .unwrap();

        // "a" has no _rev (stale write), "b" is fine.
        let rows = store
            .apply_bulk(
                vec![json!({"_id": "a", "v": 2}), json!({"_id": "b", "v": 1})],
                &BulkOptions::default(),
            )
            .unwrap();

        assert_eq!(rows[0].error.as_deref(), Some("conflict"));
        assert!(rows[1].is_ok());
        // The rejected row consumed no sequence.
        assert_eq!(store.last_sequence(), Sequence::new(2));
    }

    #[test]
    fn all_or_nothing_aborts_whole_batch() {
        let store = open_store();
        store
            .apply_bulk(vec![json!({"_id": "a", "v": 1})], &BulkOptions::default())
            .unwrap();
        let before = store.last_sequence();

        let opts = BulkOptions {
            all_or_nothing: true,
            ..BulkOptions::default()
        };
        let result = store.apply_bulk(
            vec![json!({"_id": "b", "v": 1}), json!({"_id": "a", "v": 2})],
            &opts,
        );
        assert!(matches!(result, Err(EngineError::Conflict { .. })));
        assert_eq!(store.last_sequence(), before);
        assert!(store.winner("b").is_none(), "nothing from the batch commits");
    }

    #[test]
    fn update_via_bulk_with_rev() {
        let store = open_store();
        let rows = store
            .apply_bulk(vec![json!({"_id": "a", "v": 1})], &BulkOptions::default())
            .unwrap();
        let rev1 = rows[0].rev.clone().unwrap();

        let rows = store
            .apply_bulk(
                vec![json!({"_id": "a", "_rev": rev1.to_string(), "v": 2})],
                &BulkOptions::default(),
            )
            .unwrap();
        assert!(rows[0].is_ok());
        assert_eq!(rows[0].rev.as_ref().unwrap().generation(), 2);
    }

    #[test]
    fn generates_ids_for_anonymous_docs() {
        let store = open_store();
        let rows = store
            .apply_bulk(vec![json!({"v": 1})], &BulkOptions::default())
            .unwrap();
        assert!(rows[0].is_ok());
        assert!(!rows[0].id.is_empty());
        assert!(store.winner(&rows[0].id).is_some());
    }

    #[test]
    fn replicated_batch_applies_histories() {
        let store = open_store();
        let opts = BulkOptions {
            new_edits: false,
            ..BulkOptions::default()
        };
        let rows = store
            .apply_bulk(
                vec![json!({
                    "_id": "remote",
                    "_revisions": {"start": 3, "ids": ["ccc", "bbb", "aaa"]},
                    "from": "peer",
                })],
                &opts,
            )
            .unwrap();
        assert!(rows[0].is_ok());
        assert_eq!(rows[0].rev.as_ref().unwrap().to_string(), "3-ccc");

        let doc = store
            .get_document("remote", None, &GetOptions::default())
            .unwrap();
        assert_eq!(doc["from"], "peer");
    }

    #[test]
    fn replayed_losing_leaf_echoes_its_own_rev() {
        let store = open_store();
        let opts = BulkOptions {
            new_edits: false,
            ..BulkOptions::default()
        };
        // Two conflicting leaves: 1-ffff wins over 1-aaaa.
        store
            .apply_bulk(
                vec![
                    json!({"_id": "doc", "_rev": "1-ffff", "side": "winner"}),
                    json!({"_id": "doc", "_rev": "1-aaaa", "side": "loser"}),
                ],
                &opts,
            )
            .unwrap();

        // A peer re-pushes the losing leaf: the row reports the rev it sent.
        let rows = store
            .apply_bulk(
                vec![json!({"_id": "doc", "_rev": "1-aaaa", "side": "loser"})],
                &opts,
            )
            .unwrap();
        assert!(rows[0].is_ok());
        assert_eq!(rows[0].rev.as_ref().unwrap().to_string(), "1-aaaa");
    }

    #[test]
    fn replicated_batch_accepts_bare_rev() {
        let store = open_store();
        let opts = BulkOptions {
            new_edits: false,
            ..BulkOptions::default()
        };
        let rows = store
            .apply_bulk(vec![json!({"_id": "r", "_rev": "1-abc", "v": 1})], &opts)
            .unwrap();
        assert!(rows[0].is_ok());
        assert_eq!(store.winner("r").unwrap().rev_id.to_string(), "1-abc");
    }

    #[test]
    fn replicated_batch_requires_identity() {
        let store = open_store();
        let opts = BulkOptions {
            new_edits: false,
            ..BulkOptions::default()
        };
        let result = store.apply_bulk(vec![json!({"_id": "r", "v": 1})], &opts);
        assert!(matches!(result, Err(EngineError::BadRequest(_))));

        let result = store.apply_bulk(vec![json!({"v": 1})], &opts);
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
    }

    #[test]
    fn malformed_input_is_fatal() {
        let store = open_store();
        let result = store.apply_bulk(
            vec![json!({"_id": "ok"}), json!("not an object")],
            &BulkOptions::default(),
        );
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
        assert_eq!(store.last_sequence(), Sequence::new(0));
    }

    #[test]
    fn inconsistent_revisions_field_rejected() {
        let store = open_store();
        let opts = BulkOptions {
            new_edits: false,
            ..BulkOptions::default()
        };
        // start smaller than the number of ids.
        let result = store.apply_bulk(
            vec![json!({"_id": "r", "_revisions": {"start": 1, "ids": ["b", "a"]}})],
            &opts,
        );
        assert!(matches!(result, Err(EngineError::BadRequest(_))));

        // _rev disagreeing with the history head.
        let result = store.apply_bulk(
            vec![json!({
                "_id": "r",
                "_rev": "2-zzz",
                "_revisions": {"start": 2, "ids": ["bbb", "aaa"]},
            })],
            &opts,
        );
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
    }

    #[test]
    fn same_doc_twice_in_one_batch() {
        let store = open_store();
        let rows = store
            .apply_bulk(vec![json!({"_id": "a", "v": 1})], &BulkOptions::default())
            .unwrap();
        let rev1 = rows[0].rev.clone().unwrap();

        // Second edit chains on the first within the same batch.
        let rows = store
            .apply_bulk(
                vec![
                    json!({"_id": "a", "_rev": rev1.to_string(), "v": 2}),
                    json!({"_id": "a", "_rev": "1-bogus", "v": 3}),
                ],
                &BulkOptions::default(),
            )
            .unwrap();
        assert!(rows[0].is_ok());
        assert_eq!(rows[1].error.as_deref(), Some("conflict"));

        // Only the surviving leaf appears in the feed.
        let feed = store
            .changes_since(&crate::change_feed::ChangesOptions::default())
            .unwrap();
        assert_eq!(feed.results.len(), 1);
        assert_eq!(feed.results[0].changes[0], rows[0].rev.clone().unwrap());
    }
}
