//! Cross-type ordering of emitted view keys.
//!
//! Keys of any JSON type sort together: null < false < true < numbers <
//! strings < arrays < objects. Numbers compare by value, strings byte-wise,
//! arrays element-wise with length as tie-breaker, objects as ordered
//! key-value pair lists.

use serde_json::Value;
use std::cmp::Ordering;

/// A view key wrapped with the total ordering, usable as a map key.
#[derive(Debug, Clone, PartialEq)]
pub struct CollationKey(pub Value);

impl Eq for CollationKey {}

impl PartialOrd for CollationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CollationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        collate(&self.0, &other.0)
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Compares two JSON values under view collation order.
#[must_use]
pub fn collate(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = collate(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.as_bytes().cmp(yk.as_bytes());
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = collate(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        // Nulls and equal booleans share a rank.
        _ => Ordering::Equal,
    }
}

/// Truncates an array key to its first `level` elements for grouped
/// reduces; non-array keys group by their whole value.
#[must_use]
pub fn group_key(key: &Value, level: usize) -> Value {
    match key {
        Value::Array(items) => Value::Array(items.iter().take(level).cloned().collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_order(values: &[Value]) {
        for (i, a) in values.iter().enumerate() {
            assert_eq!(collate(a, a), Ordering::Equal, "{a} == {a}");
            for b in &values[i + 1..] {
                assert_eq!(collate(a, b), Ordering::Less, "{a} < {b}");
                assert_eq!(collate(b, a), Ordering::Greater, "{b} > {a}");
            }
        }
    }

    #[test]
    fn cross_type_order() {
        assert_order(&[
            json!(null),
            json!(false),
            json!(true),
            json!(-5),
            json!(0),
            json!(1.5),
            json!(100),
            json!(""),
            json!("a"),
            json!("b"),
            json!([]),
            json!([1]),
            json!([1, 2]),
            json!([2]),
            json!({}),
            json!({"a": 1}),
        ]);
    }

    #[test]
    fn numbers_compare_by_value_across_forms() {
        assert_eq!(collate(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(collate(&json!(2), &json!(1.9)), Ordering::Greater);
    }

    #[test]
    fn strings_compare_byte_wise() {
        assert_eq!(collate(&json!("Z"), &json!("a")), Ordering::Less);
        assert_eq!(collate(&json!("abc"), &json!("abd")), Ordering::Less);
    }

    #[test]
    fn nested_arrays() {
        assert_eq!(
            collate(&json!(["a", 1]), &json!(["a", 2])),
            Ordering::Less
        );
        assert_eq!(
            collate(&json!(["a", [1]]), &json!(["a", [1, 0]])),
            Ordering::Less
        );
    }

    #[test]
    fn collation_key_sorts_in_btreemap() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(CollationKey(json!("s")), ());
        map.insert(CollationKey(json!(null)), ());
        map.insert(CollationKey(json!(7)), ());
        map.insert(CollationKey(json!(true)), ());

        let keys: Vec<&Value> = map.keys().map(|k| &k.0).collect();
        assert_eq!(keys, vec![&json!(null), &json!(true), &json!(7), &json!("s")]);
    }

    #[test]
    fn group_key_truncates_arrays_only() {
        assert_eq!(group_key(&json!([1, 2, 3]), 2), json!([1, 2]));
        assert_eq!(group_key(&json!([1]), 3), json!([1]));
        assert_eq!(group_key(&json!("scalar"), 1), json!("scalar"));
    }
}
