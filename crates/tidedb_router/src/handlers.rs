//! Endpoint handlers, one method per route.

use crate::error::{RouterError, RouterResult};
use crate::request::{Request, Response};
use crate::router::Router;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tidedb_core::{
    changes_field, Body, BulkOptions, ChangeStyle, ChangesOptions, EngineError, GetOptions,
    QueryOptions, RevId, Sequence,
};

fn quoted(rev: &str) -> String {
    format!("\"{rev}\"")
}

fn parse_rev(s: &str) -> RouterResult<RevId> {
    Ok(RevId::parse(s)?)
}

fn rev_list(value: &Value, context: &str) -> RouterResult<Vec<RevId>> {
    let items = value
        .as_array()
        .ok_or_else(|| RouterError::bad_request(format!("{context} must be an array")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| {
                    RouterError::bad_request(format!("{context} entries must be strings"))
                })
                .and_then(parse_rev)
        })
        .collect()
}

impl Router {
    // ------------------------------------------------------------------
    // Database
    // ------------------------------------------------------------------

    pub(crate) fn db_info(&self, _req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let info = self.db.info()?;
        Ok(Response::ok(json!(info)))
    }

    pub(crate) fn compact(&self, _req: &Request, _args: &[&str]) -> RouterResult<Response> {
        self.db.compact()?;
        Ok(Response::accepted(json!({"ok": true})))
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub(crate) fn get_document(&self, req: &Request, args: &[&str]) -> RouterResult<Response> {
        let doc_id = args[0];
        let opts = GetOptions {
            include_history: req.bool_param("revs")?.unwrap_or(false),
            include_conflicts: req.bool_param("conflicts")?.unwrap_or(false),
            local_seq: req.bool_param("local_seq")?.unwrap_or(false),
            include_attachment_data: req.bool_param("attachments")?.unwrap_or(false),
            atts_since: match req.json_param("atts_since")? {
                Some(value) => rev_list(&value, "atts_since")?,
                None => Vec::new(),
            },
        };

        if let Some(open_revs) = req.param("open_revs") {
            if open_revs != "all" {
                return Err(RouterError::bad_request("open_revs only supports \"all\""));
            }
            let leaves = self.db.get_all_leaves(doc_id, true)?;
            let mut results = Vec::with_capacity(leaves.len());
            for leaf in &leaves {
                let doc = self.db.get_document(doc_id, Some(&leaf.rev_id), &opts)?;
                results.push(json!({"ok": doc}));
            }
            return Ok(Response::ok(Value::Array(results)));
        }

        let rev = match req.param("rev") {
            Some(s) => Some(parse_rev(s)?),
            None => None,
        };
        let doc = self.db.get_document(doc_id, rev.as_ref(), &opts)?;
        let etag = doc
            .get("_rev")
            .and_then(Value::as_str)
            .map(quoted)
            .ok_or_else(|| RouterError::bad_request("document is missing _rev"))?;
        if req.if_none_match.as_deref() == Some(etag.as_str()) {
            return Ok(Response::not_modified(etag));
        }
        Ok(Response::ok(Value::Object(doc)).with_etag(etag))
    }

    pub(crate) fn put_document(&self, req: &Request, args: &[&str]) -> RouterResult<Response> {
        let doc_id = args[0];
        let body = req.object_body()?.clone();
        if let Some(id) = body.get("_id") {
            if id.as_str() != Some(doc_id) {
                return Err(RouterError::bad_request("body _id does not match the path"));
            }
        }
        let parent = self.write_parent(req, &body)?;

        let revision = if body.get("_deleted") == Some(&Value::Bool(true)) {
            let parent = parent
                .ok_or_else(|| RouterError::from(EngineError::conflict(doc_id)))?;
            self.db.delete_document(doc_id, parent)?
        } else {
            self.db
                .put_document(Some(doc_id.to_string()), body, parent)?
        };
        Ok(Self::write_response(revision))
    }

    pub(crate) fn post_document(&self, req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let body = req.object_body()?.clone();
        let doc_id = match body.get("_id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(RouterError::bad_request("_id must be a string")),
            None => None,
        };
        let parent = self.write_parent(req, &body)?;
        let revision = self.db.put_document(doc_id, body, parent)?;
        Ok(Self::write_response(revision))
    }

    pub(crate) fn delete_document(&self, req: &Request, args: &[&str]) -> RouterResult<Response> {
        let doc_id = args[0];
        // A deletion without an expected parent is a conflict, same as a
        // stale one.
        let parent = match req.param("rev") {
            Some(s) => parse_rev(s)?,
            None => return Err(EngineError::conflict(doc_id).into()),
        };
        let revision = self.db.delete_document(doc_id, parent)?;
        let rev = revision.rev_id.to_string();
        Ok(Response::ok(json!({
            "ok": true,
            "id": revision.doc_id,
            "rev": rev,
        }))
        .with_etag(quoted(&rev)))
    }

    /// Expected parent of a write: the `rev` query parameter or the body's
    /// `_rev`, which must agree when both are present.
    fn write_parent(&self, req: &Request, body: &Body) -> RouterResult<Option<RevId>> {
        let query_rev = match req.param("rev") {
            Some(s) => Some(parse_rev(s)?),
            None => None,
        };
        let body_rev = match body.get("_rev") {
            Some(Value::String(s)) => Some(parse_rev(s)?),
            Some(_) => return Err(RouterError::bad_request("_rev must be a string")),
            None => None,
        };
        match (query_rev, body_rev) {
            (Some(q), Some(b)) if q != b => {
                Err(RouterError::bad_request("rev parameter contradicts body _rev"))
            }
            (q, b) => Ok(q.or(b)),
        }
    }

    fn write_response(revision: tidedb_core::Revision) -> Response {
        let rev = revision.rev_id.to_string();
        Response::created(json!({
            "ok": true,
            "id": revision.doc_id,
            "rev": rev,
        }))
        .with_etag(quoted(&rev))
    }

    // ------------------------------------------------------------------
    // Batches and listings
    // ------------------------------------------------------------------

    pub(crate) fn bulk_docs(&self, req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let body = req.object_body()?;
        let docs = match body.get("docs") {
            Some(Value::Array(docs)) => docs.clone(),
            _ => return Err(RouterError::bad_request("docs must be an array")),
        };
        let opts = BulkOptions {
            new_edits: Self::body_flag(body, "new_edits")?.unwrap_or(true),
            all_or_nothing: Self::body_flag(body, "all_or_nothing")?.unwrap_or(false),
        };
        let rows = self.db.apply_bulk(docs, &opts)?;
        Ok(Response::created(json!(rows)))
    }

    fn body_flag(body: &Body, key: &str) -> RouterResult<Option<bool>> {
        match body.get(key) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(_) => Err(RouterError::bad_request(format!("{key} must be a boolean"))),
        }
    }

    pub(crate) fn all_docs(&self, req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let include_docs = req.bool_param("include_docs")?.unwrap_or(false);
        let rows = self.db.all_docs(include_docs)?;
        let total_rows = rows.len();
        let rows: Vec<Value> = rows
            .into_iter()
            .map(|row| {
                let mut obj = json!({
                    "id": row.id.clone(),
                    "key": row.id,
                    "value": {"rev": row.rev.to_string()},
                });
                if let Some(doc) = row.doc {
                    obj["doc"] = Value::Object(doc);
                }
                obj
            })
            .collect();
        Ok(Response::ok(json!({
            "total_rows": total_rows,
            "offset": 0,
            "rows": rows,
        })))
    }

    // ------------------------------------------------------------------
    // Replication surface
    // ------------------------------------------------------------------

    pub(crate) fn changes(&self, req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let style = match req.param("style") {
            Some(s) => ChangeStyle::parse(s)?,
            None => ChangeStyle::default(),
        };
        let mut filter_params = Body::new();
        for (key, value) in &req.query {
            filter_params.insert(key.clone(), Value::String(value.clone()));
        }
        let opts = ChangesOptions {
            since: Sequence(req.u64_param("since")?.unwrap_or(0)),
            limit: req.u64_param("limit")?.map(|n| n as usize),
            style,
            include_docs: req.bool_param("include_docs")?.unwrap_or(false),
            filter: req.param("filter").map(str::to_string),
            filter_params,
        };

        let result = match req.param("feed").unwrap_or("normal") {
            "normal" => self.db.changes_since(&opts)?,
            "longpoll" => {
                let timeout = req.u64_param("timeout")?.map(Duration::from_millis);
                self.db.changes_longpoll(&opts, timeout)?
            }
            "continuous" => {
                return Err(RouterError::bad_request(
                    "continuous feeds are only available through the embedded subscription API",
                ));
            }
            other => {
                return Err(RouterError::bad_request(format!("unknown feed mode {other:?}")));
            }
        };

        let results: Vec<Value> = result
            .results
            .into_iter()
            .map(|row| {
                let mut obj = json!({
                    "seq": row.seq,
                    "id": row.id,
                    "changes": changes_field(&row.changes),
                });
                if row.deleted {
                    obj["deleted"] = Value::Bool(true);
                }
                if let Some(doc) = row.doc {
                    obj["doc"] = Value::Object(doc);
                }
                obj
            })
            .collect();
        Ok(Response::ok(json!({
            "results": results,
            "last_seq": result.last_seq,
        })))
    }

    pub(crate) fn revs_diff(&self, req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let body = req.object_body()?;
        let mut request = BTreeMap::new();
        for (doc_id, revs) in body {
            request.insert(doc_id.clone(), rev_list(revs, doc_id)?);
        }
        let diff = self.db.revs_diff(&request)?;
        Ok(Response::ok(json!(diff)))
    }

    pub(crate) fn purge(&self, req: &Request, _args: &[&str]) -> RouterResult<Response> {
        let body = req.object_body()?;
        let mut purged = Body::new();
        for (doc_id, revs) in body {
            // Purge removes the whole tree; the requested revisions are
            // echoed back as removed.
            rev_list(revs, doc_id)?;
            self.db.purge(doc_id)?;
            purged.insert(doc_id.clone(), revs.clone());
        }
        Ok(Response::ok(json!({"purged": purged})))
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub(crate) fn view_query(&self, req: &Request, args: &[&str]) -> RouterResult<Response> {
        let (ddoc, view) = (args[0], args[1]);
        let update = match req.param("stale") {
            Some("ok") => Some(false),
            Some(other) => {
                return Err(RouterError::bad_request(format!("unknown stale mode {other:?}")));
            }
            None => req.bool_param("update")?,
        };
        let opts = QueryOptions {
            key: req.json_param("key")?,
            keys: match req.json_param("keys")? {
                Some(Value::Array(keys)) => Some(keys),
                Some(_) => return Err(RouterError::bad_request("keys must be a JSON array")),
                None => None,
            },
            start_key: req.json_param("startkey")?,
            end_key: req.json_param("endkey")?,
            inclusive_end: req.bool_param("inclusive_end")?.unwrap_or(true),
            descending: req.bool_param("descending")?.unwrap_or(false),
            skip: req.u64_param("skip")?.unwrap_or(0) as usize,
            limit: req.u64_param("limit")?.map(|n| n as usize),
            include_docs: req.bool_param("include_docs")?.unwrap_or(false),
            reduce: req.bool_param("reduce")?,
            group: req.bool_param("group")?.unwrap_or(false),
            group_level: req.u64_param("group_level")?.map(|n| n as usize),
            update,
        };
        let result = self.db.query_view(ddoc, view, &opts)?;
        Ok(Response::ok(json!(result)))
    }
}
