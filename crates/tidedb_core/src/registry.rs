//! Injected registries for filters, validators, and view functions.
//!
//! TideDB never consults global state for callables: each store instance
//! is constructed with its own registries, so multiple stores can coexist
//! with independent filter and view sets. The engine treats the function
//! bodies as opaque; compiling or sandboxing them is out of scope.

use crate::revision::Revision;
use crate::types::Body;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A change-feed filter: `true` keeps the change.
///
/// The second argument carries the caller's filter parameters
/// (`?filter=name&key=value` query arguments).
pub type FilterFn = Arc<dyn Fn(&Revision, &Body) -> bool + Send + Sync>;

/// A document validation hook, run before any edit commits.
///
/// Receives the proposed revision and the revision it replaces (if any);
/// returning `Err(reason)` rejects the edit with `Forbidden`.
pub type ValidatorFn =
    Arc<dyn Fn(&Revision, Option<&Revision>) -> Result<(), String> + Send + Sync>;

/// A view map function: `map(document) -> sequence of (key, value)`.
///
/// Called with the winning revision's properties (`_id`/`_rev` embedded).
pub type MapFn = Arc<dyn Fn(&Body) -> Vec<(Value, Value)> + Send + Sync>;

/// A view reduce function: `reduce(keys, values, rereduce) -> value`.
pub type ReduceFn = Arc<dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync>;

/// A view definition: the map function and an optional reduce.
#[derive(Clone)]
pub struct ViewDef {
    /// Map function.
    pub map: MapFn,
    /// Reduce function, if the view defines one.
    pub reduce: Option<ReduceFn>,
}

/// Named callables injected into a store at construction.
#[derive(Clone, Default)]
pub struct Registries {
    filters: HashMap<String, FilterFn>,
    validators: Vec<ValidatorFn>,
    views: HashMap<String, ViewDef>,
}

impl Registries {
    /// Creates an empty registry set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named change-feed filter.
    #[must_use]
    pub fn filter(mut self, name: impl Into<String>, f: FilterFn) -> Self {
        self.filters.insert(name.into(), f);
        self
    }

    /// Registers a validation hook. Hooks run in registration order; the
    /// first rejection wins.
    #[must_use]
    pub fn validator(mut self, f: ValidatorFn) -> Self {
        self.validators.push(f);
        self
    }

    /// Registers a view under `ddoc/name`.
    ///
    /// `reduce` may name a built-in (`"_count"`, `"_sum"`) via
    /// [`builtin_reduce`].
    #[must_use]
    pub fn view(
        mut self,
        ddoc: impl Into<String>,
        name: impl Into<String>,
        map: MapFn,
        reduce: Option<ReduceFn>,
    ) -> Self {
        self.views
            .insert(view_key(&ddoc.into(), &name.into()), ViewDef { map, reduce });
        self
    }

    /// Looks up a filter by name.
    #[must_use]
    pub fn get_filter(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    /// Returns all validation hooks in registration order.
    #[must_use]
    pub fn validators(&self) -> &[ValidatorFn] {
        &self.validators
    }

    /// Looks up a view definition.
    #[must_use]
    pub fn get_view(&self, ddoc: &str, name: &str) -> Option<&ViewDef> {
        self.views.get(&view_key(ddoc, name))
    }

    /// All registered view keys (`ddoc/name`).
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        self.views.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Registries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registries")
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("validators", &self.validators.len())
            .field("views", &self.views.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn view_key(ddoc: &str, name: &str) -> String {
    format!("{ddoc}/{name}")
}

/// Returns a built-in reduce function by its CouchDB name.
///
/// - `_count`: number of mapped rows (sum of partial counts on rereduce)
/// - `_sum`: numeric sum of the mapped values
#[must_use]
pub fn builtin_reduce(name: &str) -> Option<ReduceFn> {
    match name {
        "_count" => Some(Arc::new(|_keys, values, rereduce| {
            if rereduce {
                let total: f64 = values.iter().filter_map(Value::as_f64).sum();
                json_number(total)
            } else {
                Value::from(values.len() as u64)
            }
        })),
        "_sum" => Some(Arc::new(|_keys, values, _rereduce| {
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            json_number(total)
        })),
        _ => None,
    }
}

fn json_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (u64::MAX as f64) {
        if n >= 0.0 {
            Value::from(n as u64)
        } else {
            Value::from(n as i64)
        }
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_lookup() {
        let registries =
            Registries::new().filter("by_type", Arc::new(|rev, params| {
                let wanted = params.get("type").and_then(Value::as_str);
                rev.body
                    .as_ref()
                    .and_then(|b| b.get("type"))
                    .and_then(Value::as_str)
                    == wanted
            }));

        assert!(registries.get_filter("by_type").is_some());
        assert!(registries.get_filter("missing").is_none());
    }

    #[test]
    fn view_lookup() {
        let registries = Registries::new().view(
            "things",
            "by_name",
            Arc::new(|_doc| vec![]),
            None,
        );
        assert!(registries.get_view("things", "by_name").is_some());
        assert!(registries.get_view("things", "other").is_none());
    }

    #[test]
    fn builtin_count() {
        let count = builtin_reduce("_count").unwrap();
        let values = vec![json!(1), json!(1), json!(1)];
        assert_eq!(count(&[], &values, false), json!(3));
        // Rereduce sums partial counts.
        assert_eq!(count(&[], &[json!(3), json!(2)], true), json!(5));
    }

    #[test]
    fn builtin_sum() {
        let sum = builtin_reduce("_sum").unwrap();
        let values = vec![json!(1.5), json!(2), json!(3)];
        assert_eq!(sum(&[], &values, false), json!(6.5));
        assert_eq!(sum(&[], &[json!(2), json!(4)], true), json!(6));
    }

    #[test]
    fn unknown_builtin() {
        assert!(builtin_reduce("_stats").is_none());
    }
}
