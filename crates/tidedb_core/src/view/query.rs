//! View queries: key-range scans over the index, with optional reduce.

use crate::error::{EngineError, EngineResult};
use crate::store::GetOptions;
use crate::types::Body;
use crate::view::collation::{collate, group_key};
use crate::view::index::View;
use serde_json::Value;
use std::cmp::Ordering;

/// Options of one view query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Exact key to match; overrides `keys` and the range bounds.
    pub key: Option<Value>,
    /// Explicit set of keys to match, returned in request order;
    /// overrides the range bounds.
    pub keys: Option<Vec<Value>>,
    /// First key of the range, in scan direction.
    pub start_key: Option<Value>,
    /// Last key of the range, in scan direction.
    pub end_key: Option<Value>,
    /// Whether `end_key` itself is part of the range (default true).
    pub inclusive_end: bool,
    /// Scan the index in reverse collation order.
    pub descending: bool,
    /// Rows to drop from the front of the result.
    pub skip: usize,
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Embed each row's winning document (map queries only).
    pub include_docs: bool,
    /// Run the reduce function; defaults to true when the view has one.
    pub reduce: Option<bool>,
    /// Group reduced rows by exact key.
    pub group: bool,
    /// Group reduced rows by array-key prefix of this length.
    pub group_level: Option<usize>,
    /// Refresh the index before reading; defaults to the store config.
    pub update: Option<bool>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            key: None,
            keys: None,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            skip: 0,
            limit: None,
            include_docs: false,
            reduce: None,
            group: false,
            group_level: None,
            update: None,
        }
    }
}

/// One result row. Reduced rows carry no document ID.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ViewRow {
    /// Emitting document, absent on reduced rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Emitted (or group) key; `null` for an ungrouped reduce.
    pub key: Value,
    /// Emitted or reduced value.
    pub value: Value,
    /// The winning document, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Body>,
}

/// A query result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QueryResult {
    /// Total rows in the index (before range filtering).
    pub total_rows: usize,
    /// Index rows preceding the first returned one, in scan direction.
    pub offset: usize,
    /// Result rows.
    pub rows: Vec<ViewRow>,
}

impl View {
    /// Runs a query against the index.
    ///
    /// Unless disabled via `update` (or store config), the index is
    /// brought up to date first. Map queries scan the collation-ordered
    /// key range; reduce queries fold the same range through the view's
    /// reduce function, optionally grouped.
    pub fn query(&self, opts: &QueryOptions) -> EngineResult<QueryResult> {
        let refresh = opts
            .update
            .unwrap_or(self.store().config().update_views_on_query);
        if refresh {
            self.update_index()?;
        }

        let reduce = match opts.reduce {
            Some(true) if !self.has_reduce() => {
                return Err(EngineError::bad_request("view has no reduce function"))
            }
            Some(explicit) => explicit,
            None => self.has_reduce(),
        };
        if (opts.group || opts.group_level.is_some()) && !reduce {
            return Err(EngineError::bad_request(
                "grouping requires a reduce function",
            ));
        }

        let (total_rows, offset, selected) = self.select(opts);
        if !reduce {
            let mut rows = Vec::with_capacity(selected.len());
            for (id, key, value) in selected {
                let doc = if opts.include_docs {
                    self.store()
                        .get_document(&id, None, &GetOptions::default())
                        .ok()
                } else {
                    None
                };
                rows.push(ViewRow {
                    id: Some(id),
                    key,
                    value,
                    doc,
                });
            }
            return Ok(QueryResult {
                total_rows,
                offset,
                rows,
            });
        }

        Ok(QueryResult {
            total_rows,
            offset: 0,
            rows: self.reduce_rows(selected, opts)?,
        })
    }

    /// Scans the index in direction order and returns
    /// `(total_rows, offset, matching (id, key, value) triples)`.
    /// For map queries skip/limit are applied here; reduce queries get
    /// the full range (skip/limit then apply to reduced rows).
    fn select(&self, opts: &QueryOptions) -> (usize, usize, Vec<(String, Value, Value)>) {
        let reduce_pass = opts.reduce.unwrap_or(self.has_reduce());
        self.with_rows(|rows| {
            let total = rows.len();

            // An explicit key set short-circuits the range scan; rows come
            // back in the requested keys' order.
            if opts.key.is_none() {
                if let Some(keys) = &opts.keys {
                    let mut matching: Vec<(String, Value, Value)> = Vec::new();
                    for wanted in keys {
                        for (row_key, value) in rows.iter() {
                            if collate(&row_key.key.0, wanted) == Ordering::Equal {
                                matching.push((
                                    row_key.doc_id.clone(),
                                    row_key.key.0.clone(),
                                    value.clone(),
                                ));
                            }
                        }
                    }
                    if reduce_pass {
                        return (total, 0, matching);
                    }
                    let offset = opts.skip.min(matching.len());
                    let mut window: Vec<_> =
                        matching.into_iter().skip(opts.skip).collect();
                    if let Some(limit) = opts.limit {
                        window.truncate(limit);
                    }
                    return (total, offset, window);
                }
            }

            let mut matching: Vec<(String, Value, Value)> = Vec::new();
            let mut preceding = 0usize;

            let in_range = |key: &Value| -> Ordering {
                // Ordering::Less = before the range, Greater = past it.
                if let Some(exact) = &opts.key {
                    return collate(key, exact);
                }
                let (low, high) = if opts.descending {
                    (&opts.end_key, &opts.start_key)
                } else {
                    (&opts.start_key, &opts.end_key)
                };
                let (low_open, high_open) = if opts.descending {
                    (!opts.inclusive_end, false)
                } else {
                    (false, !opts.inclusive_end)
                };
                if let Some(low) = low {
                    match collate(key, low) {
                        Ordering::Less => return Ordering::Less,
                        Ordering::Equal if low_open => return Ordering::Less,
                        _ => {}
                    }
                }
                if let Some(high) = high {
                    match collate(key, high) {
                        Ordering::Greater => return Ordering::Greater,
                        Ordering::Equal if high_open => return Ordering::Greater,
                        _ => {}
                    }
                }
                Ordering::Equal
            };

            for (row_key, value) in rows.iter() {
                match in_range(&row_key.key.0) {
                    Ordering::Equal => matching.push((
                        row_key.doc_id.clone(),
                        row_key.key.0.clone(),
                        value.clone(),
                    )),
                    // Rows before the range position the offset.
                    Ordering::Less if !opts.descending => preceding += 1,
                    Ordering::Greater if opts.descending => preceding += 1,
                    _ => {}
                }
            }
            if opts.descending {
                matching.reverse();
            }

            if reduce_pass {
                return (total, preceding, matching);
            }

            let offset = preceding + opts.skip.min(matching.len());
            let mut window: Vec<_> = matching.into_iter().skip(opts.skip).collect();
            if let Some(limit) = opts.limit {
                window.truncate(limit);
            }
            (total, offset, window)
        })
    }

    fn reduce_rows(
        &self,
        selected: Vec<(String, Value, Value)>,
        opts: &QueryOptions,
    ) -> EngineResult<Vec<ViewRow>> {
        let Some(reduce) = &self.definition().reduce else {
            return Err(EngineError::bad_request("view has no reduce function"));
        };

        let mut rows = Vec::new();
        if opts.group || opts.group_level.is_some() {
            let level = opts.group_level.unwrap_or(usize::MAX);
            // Selected rows arrive in key order, so groups are contiguous.
            let mut current: Option<(Value, Vec<Value>, Vec<Value>)> = None;
            for (_, key, value) in selected {
                let gkey = group_key(&key, level);
                match &mut current {
                    Some((open_key, keys, values))
                        if collate(open_key, &gkey) == Ordering::Equal =>
                    {
                        keys.push(key);
                        values.push(value);
                    }
                    _ => {
                        if let Some((open_key, keys, values)) = current.take() {
                            rows.push(ViewRow {
                                id: None,
                                key: open_key,
                                value: reduce(&keys, &values, false),
                                doc: None,
                            });
                        }
                        current = Some((gkey, vec![key], vec![value]));
                    }
                }
            }
            if let Some((open_key, keys, values)) = current {
                rows.push(ViewRow {
                    id: None,
                    key: open_key,
                    value: reduce(&keys, &values, false),
                    doc: None,
                });
            }
        } else if !selected.is_empty() {
            let mut keys = Vec::with_capacity(selected.len());
            let mut values = Vec::with_capacity(selected.len());
            for (_, key, value) in selected {
                keys.push(key);
                values.push(value);
            }
            rows.push(ViewRow {
                id: None,
                key: Value::Null,
                value: reduce(&keys, &values, false),
                doc: None,
            });
        }

        let mut rows: Vec<ViewRow> = rows.into_iter().skip(opts.skip).collect();
        if let Some(limit) = opts.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::{builtin_reduce, Registries, ViewDef};
    use crate::store::RevisionStore;
    use serde_json::json;
    use std::sync::Arc;
    use tidedb_storage::{MemoryBackend, StorageBackend};

    /// Emits `(name, qty)` per line item of an order document.
    fn fixture(reduce: Option<&str>) -> (Arc<RevisionStore>, View) {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let store = Arc::new(
            RevisionStore::open(backend, Config::default(), Arc::new(Registries::new()))
                .unwrap(),
        );
        let def = ViewDef {
            map: Arc::new(|doc: &Body| {
                doc.get("items")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                Some((
                                    item.get("name")?.clone(),
                                    item.get("qty").cloned().unwrap_or(json!(1)),
                                ))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            }),
            reduce: reduce.and_then(builtin_reduce),
        };
        let view = View::open(Arc::clone(&store), "orders/by_item", def).unwrap();
        (store, view)
    }

    fn body(v: serde_json::Value) -> Body {
        v.as_object().unwrap().clone()
    }

    fn put(store: &RevisionStore, id: &str, v: serde_json::Value) {
        let parent = store.winner(id).map(|w| w.rev_id);
        store
            .insert(Some(id.into()), body(v), false, parent, false)
            .unwrap();
    }

    fn seed(store: &RevisionStore) {
        put(
            store,
            "o1",
            json!({"items": [{"name": "apple", "qty": 2}, {"name": "fig", "qty": 1}]}),
        );
        put(store, "o2", json!({"items": [{"name": "apple", "qty": 3}]}));
        put(
            store,
            "o3",
            json!({"items": [{"name": "kiwi", "qty": 5}, {"name": "pear", "qty": 4}]}),
        );
    }

    #[test]
    fn query_refreshes_stale_index_by_default() {
        let (store, view) = fixture(None);
        seed(&store);

        let result = view.query(&QueryOptions::default()).unwrap();
        assert_eq!(result.total_rows, 5);
        assert_eq!(result.rows.len(), 5);
        let keys: Vec<&str> = result
            .rows
            .iter()
            .map(|r| r.key.as_str().unwrap())
            .collect();
        assert_eq!(keys, vec!["apple", "apple", "fig", "kiwi", "pear"]);
    }

    #[test]
    fn stale_read_when_update_disabled() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            update: Some(false),
            ..QueryOptions::default()
        };
        assert!(view.query(&opts).unwrap().rows.is_empty());

        view.update_index().unwrap();
        put(&store, "o4", json!({"items": [{"name": "yam"}]}));
        // The earlier rows are served; the new commit is not.
        assert_eq!(view.query(&opts).unwrap().rows.len(), 5);
    }

    #[test]
    fn exact_key_match() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            key: Some(json!("apple")),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows.len(), 2);
        let ids: Vec<&str> = result
            .rows
            .iter()
            .map(|r| r.id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["o1", "o2"]);
    }

    #[test]
    fn key_set_selects_in_request_order() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            keys: Some(vec![json!("pear"), json!("apple"), json!("nope")]),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        let keys: Vec<&str> = result
            .rows
            .iter()
            .map(|r| r.key.as_str().unwrap())
            .collect();
        assert_eq!(keys, vec!["pear", "apple", "apple"]);
        assert_eq!(result.offset, 0);
    }

    #[test]
    fn range_with_inclusive_and_exclusive_end() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            start_key: Some(json!("apple")),
            end_key: Some(json!("kiwi")),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows.len(), 4);
        assert_eq!(result.offset, 0);

        let opts = QueryOptions {
            inclusive_end: false,
            ..opts
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows.len(), 3);
    }

    #[test]
    fn descending_reverses_scan() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            descending: true,
            start_key: Some(json!("kiwi")),
            end_key: Some(json!("apple")),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        let keys: Vec<&str> = result
            .rows
            .iter()
            .map(|r| r.key.as_str().unwrap())
            .collect();
        assert_eq!(keys, vec!["kiwi", "fig", "apple", "apple"]);
        // One row ("pear") lies past the start key in scan direction.
        assert_eq!(result.offset, 1);
    }

    #[test]
    fn skip_and_limit_window() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            skip: 1,
            limit: Some(2),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.offset, 1);
        assert_eq!(result.rows[0].key, json!("apple"));
        assert_eq!(result.rows[1].key, json!("fig"));
    }

    #[test]
    fn include_docs_embeds_winner() {
        let (store, view) = fixture(None);
        seed(&store);

        let opts = QueryOptions {
            key: Some(json!("kiwi")),
            include_docs: true,
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        let doc = result.rows[0].doc.as_ref().unwrap();
        assert_eq!(doc["_id"], "o3");
    }

    #[test]
    fn ungrouped_reduce_folds_everything() {
        let (store, view) = fixture(Some("_sum"));
        seed(&store);

        let result = view.query(&QueryOptions::default()).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].key, Value::Null);
        assert!(result.rows[0].id.is_none());
        assert_eq!(result.rows[0].value, json!(15));
    }

    #[test]
    fn grouped_reduce_by_exact_key() {
        let (store, view) = fixture(Some("_sum"));
        seed(&store);

        let opts = QueryOptions {
            group: true,
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        let pairs: Vec<(&str, u64)> = result
            .rows
            .iter()
            .map(|r| (r.key.as_str().unwrap(), r.value.as_u64().unwrap()))
            .collect();
        assert_eq!(
            pairs,
            vec![("apple", 5), ("fig", 1), ("kiwi", 5), ("pear", 4)]
        );
    }

    #[test]
    fn reduce_false_returns_map_rows() {
        let (store, view) = fixture(Some("_count"));
        seed(&store);

        let opts = QueryOptions {
            reduce: Some(false),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows.len(), 5);
        assert!(result.rows[0].id.is_some());
    }

    #[test]
    fn reduce_respects_key_range() {
        let (store, view) = fixture(Some("_count"));
        seed(&store);

        let opts = QueryOptions {
            key: Some(json!("apple")),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows[0].value, json!(2));
    }

    #[test]
    fn group_level_truncates_array_keys() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let store = Arc::new(
            RevisionStore::open(backend, Config::default(), Arc::new(Registries::new()))
                .unwrap(),
        );
        // Emits [region, city] -> population.
        let def = ViewDef {
            map: Arc::new(|doc: &Body| {
                match (doc.get("region"), doc.get("city"), doc.get("pop")) {
                    (Some(r), Some(c), Some(p)) => {
                        vec![(json!([r, c]), p.clone())]
                    }
                    _ => Vec::new(),
                }
            }),
            reduce: builtin_reduce("_sum"),
        };
        let view = View::open(Arc::clone(&store), "geo/pop", def).unwrap();
        put(&store, "1", json!({"region": "north", "city": "a", "pop": 10}));
        put(&store, "2", json!({"region": "north", "city": "b", "pop": 20}));
        put(&store, "3", json!({"region": "south", "city": "c", "pop": 5}));

        let opts = QueryOptions {
            group_level: Some(1),
            ..QueryOptions::default()
        };
        let result = view.query(&opts).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].key, json!(["north"]));
        assert_eq!(result.rows[0].value, json!(30));
        assert_eq!(result.rows[1].key, json!(["south"]));
        assert_eq!(result.rows[1].value, json!(5));
    }

    #[test]
    fn grouping_without_reduce_is_rejected() {
        let (_store, view) = fixture(None);
        let opts = QueryOptions {
            group: true,
            ..QueryOptions::default()
        };
        assert!(matches!(
            view.query(&opts),
            Err(EngineError::BadRequest(_))
        ));

        let opts = QueryOptions {
            reduce: Some(true),
            ..QueryOptions::default()
        };
        assert!(matches!(
            view.query(&opts),
            Err(EngineError::BadRequest(_))
        ));
    }
}
