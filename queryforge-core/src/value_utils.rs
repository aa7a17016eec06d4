//! JSON helpers shared across the compiler
//!
//! Path normalization, dotted-key expansion, key-order independent equality
//! and the flattening used by projections and native index checks.

use crate::limits::FIELD_PATH_REGEX;
use serde_json::{Map, Value};

/// Strip operator (`$`) and positional (numeric) segments from a dotted path.
///
/// # Examples
///
/// ```
/// use queryforge_core::value_utils::normalize_property_path;
///
/// assert_eq!(normalize_property_path("c_arr.$elemMatch.c_x.$gt"), "c_arr.c_x");
/// assert_eq!(normalize_property_path("$or.c_age"), "c_age");
/// ```
pub fn normalize_property_path(path: &str) -> String {
    path.split('.')
        .filter(|segment| {
            !segment.is_empty()
                && !segment.starts_with('$')
                && !segment.chars().all(|c| c.is_ascii_digit())
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// A dotted path made of valid field names only
pub fn is_valid_property_path(path: &str) -> bool {
    FIELD_PATH_REGEX.is_match(path)
}

/// Last segment of a dotted path
pub fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Set a value at a nested path, creating intermediate objects.
///
/// A non-object found along the way is replaced by an object, so a later
/// dotted key wins over an earlier scalar at the same prefix.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use queryforge_core::value_utils::set_nested_value;
///
/// let mut doc = json!({"name": "Alice"});
/// set_nested_value(&mut doc, "address.city", json!("NYC"));
/// assert_eq!(doc["address"]["city"], "NYC");
/// ```
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = match current {
            Value::Object(map) => map,
            _ => return,
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Expand dotted top-level keys into nested objects, preserving key order.
///
/// `{"a.b": 1, "c": 2}` becomes `{"a": {"b": 1}, "c": 2}`.
pub fn expand_dotted_keys(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Value::Object(Map::new());
    for (key, value) in map {
        set_nested_value(&mut out, key, value.clone());
    }
    match out {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Canonical string of a JSON value with object keys sorted, so logically
/// equal values produce equal strings regardless of key order.
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let inner = pairs
                .iter()
                .map(|(k, v)| format!("{:?}:{}", k, canonical_json_string(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", inner)
        }
        Value::Array(arr) => {
            let inner = arr
                .iter()
                .map(canonical_json_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        other => other.to_string(),
    }
}

/// Key-order independent equality
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    canonical_json_string(a) == canonical_json_string(b)
}

pub fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().map_or(false, |f| f.fract() == 0.0),
        _ => false,
    }
}

pub fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    }
}

pub fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

/// `1` or `true`
pub fn is_inclusion(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || as_integer(value) == Some(1)
}

/// Property keys referenced by a match document.
///
/// Logical operator arrays (`$and`, `$or`, `$nor`) are descended into; any other
/// non-operator key is recorded as-is and its value is not inspected further.
pub fn collect_query_keys(query: &Value, out: &mut Vec<String>) {
    match query {
        Value::Object(map) => {
            for (key, value) in map {
                if key.starts_with('$') {
                    if let Value::Array(items) = value {
                        for item in items {
                            collect_query_keys(item, out);
                        }
                    }
                } else if !out.contains(key) {
                    out.push(key.clone());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_query_keys(item, out);
            }
        }
        _ => {}
    }
}

/// Flatten nested inclusion objects into dotted paths.
///
/// Objects whose keys are operators are expressions and are left intact.
pub fn flatten_projection(projection: &Map<String, Value>) -> Map<String, Value> {
    fn walk(prefix: &str, map: &Map<String, Value>, out: &mut Map<String, Value>) {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match value {
                Value::Object(inner)
                    if !inner.is_empty() && !inner.keys().any(|k| k.starts_with('$')) =>
                {
                    walk(&path, inner, out)
                }
                other => {
                    out.insert(path, other.clone());
                }
            }
        }
    }
    let mut out = Map::new();
    walk("", projection, &mut out);
    out
}

/// Drop inclusions already covered by an included ancestor path.
pub fn collapse_included_paths(projection: Map<String, Value>) -> Map<String, Value> {
    let included: Vec<String> = projection
        .iter()
        .filter(|(_, value)| is_inclusion(value))
        .map(|(key, _)| key.clone())
        .collect();
    projection
        .into_iter()
        .filter(|(key, value)| {
            !is_inclusion(value)
                || !included
                    .iter()
                    .any(|parent| key.len() > parent.len() && key.starts_with(&format!("{}.", parent)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_property_path_strips_operators_and_positions() {
        assert_eq!(normalize_property_path("c_name"), "c_name");
        assert_eq!(normalize_property_path("$and.0.c_x.$in"), "c_x");
        assert_eq!(normalize_property_path("$or"), "");
    }

    #[test]
    fn test_expand_dotted_keys() {
        let input = json!({"c_doc.c_a": 1, "c_doc.c_b": 1, "c_top": "$c_x"});
        let expanded = expand_dotted_keys(input.as_object().unwrap());
        assert_eq!(
            Value::Object(expanded),
            json!({"c_doc": {"c_a": 1, "c_b": 1}, "c_top": "$c_x"})
        );
    }

    #[test]
    fn test_deep_equals_ignores_key_order() {
        assert!(deep_equals(&json!({"a": 1, "b": [1, 2]}), &json!({"b": [1, 2], "a": 1})));
        assert!(!deep_equals(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn test_collect_query_keys_descends_logical_arrays() {
        let query = json!({
            "org": 1,
            "$or": [{"c_age": {"$gt": 1}}, {"idx.d.u1.v": 2}],
            "c_name": {"$in": ["a"]}
        });
        let mut keys = Vec::new();
        collect_query_keys(&query, &mut keys);
        assert_eq!(keys, vec!["org", "c_age", "idx.d.u1.v", "c_name"]);
    }

    #[test]
    fn test_flatten_projection_keeps_expressions() {
        let projection = json!({"_id": 1, "c_doc": {"c_a": 1}, "c_total": {"$sum": "$c_x"}});
        let flat = flatten_projection(projection.as_object().unwrap());
        assert_eq!(
            Value::Object(flat),
            json!({"_id": 1, "c_doc.c_a": 1, "c_total": {"$sum": "$c_x"}})
        );
    }

    #[test]
    fn test_collapse_included_paths() {
        let projection = json!({"c_doc": 1, "c_doc.c_a": 1, "c_other.c_b": 1});
        let collapsed = collapse_included_paths(projection.as_object().unwrap().clone());
        assert_eq!(Value::Object(collapsed), json!({"c_doc": 1, "c_other.c_b": 1}));
    }

    #[test]
    fn test_integer_helpers() {
        assert!(is_integer(&json!(3)));
        assert!(is_integer(&json!(3.0)));
        assert!(!is_integer(&json!(3.5)));
        assert_eq!(as_integer(&json!(-2)), Some(-2));
        assert!(is_inclusion(&json!(true)));
        assert!(!is_inclusion(&json!(0)));
    }
}
