// queryforge-core/src/stage/matching/index_entries.rs
//! Index entry tree
//!
//! While a `$match` builds, every indexed leaf also writes its key and value
//! into a second query that mirrors the logical shape (`$and`/`$or` positions)
//! of the natural one. Branch objects are seeded with the base-find filter so
//! the planner always sees a usable compound prefix.
//!
//! A leaf whose nodes live in different custom index slots writes all of its
//! slot keys under `$branching_multi_keys`; `finish` explodes each marker into
//! an `$or` with one base-find clause per slot.

use crate::error::{CompileError, Result};
use crate::value_utils::deep_equals;
use crate::log_trace;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

pub const BRANCHING_KEY: &str = "$branching_multi_keys";

lazy_static! {
    static ref COMPOUND_SLOT_VALUE: Regex = Regex::new(r"^idx\.d\.[gui][0-9]{1,}\.").unwrap();
}

/// One step from the entry root down to a leaf's branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPart {
    /// `$and`, which also stands in for `$elemMatch` and `$all`
    And,
    /// `$or` with the number of branches it has
    Or(usize),
    /// Branch position inside the preceding array
    Position(usize),
}

/// Finished index query plus what the caller needs to decide how to use it
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledIndex {
    pub query: Map<String, Value>,
    /// A branching marker was expanded
    pub has_branches: bool,
    /// Custom slot keys (`idx.*`) are present
    pub slotted: bool,
    /// An `$or` lost a branch without entries and was dropped
    pub pruned: bool,
}

/// Custom slot key of a node: `idx.d.<slot>`, with `.v` for unique and geo slots
pub fn slot_key(slot: &str) -> String {
    if slot.starts_with('u') || slot.starts_with('g') {
        format!("idx.d.{}.v", slot)
    } else {
        format!("idx.d.{}", slot)
    }
}

/// Compound slot values (`idx.d.u1.v`) also need their parent to exist for
/// the query planner to pick the compound index.
pub fn compound_slot_fix(into: &mut Map<String, Value>, key: &str) {
    if let Some(found) = COMPOUND_SLOT_VALUE.find(key) {
        let parent = &key[..found.end() - 1];
        into.insert(parent.to_string(), serde_json::json!({ "$exists": true }));
    }
}

#[derive(Debug, Clone)]
pub struct IndexEntries {
    root: Value,
    base_find: Map<String, Value>,
}

impl IndexEntries {
    pub fn new(base_find: Map<String, Value>) -> Self {
        IndexEntries {
            root: Value::Object(Map::new()),
            base_find,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.as_object().map_or(true, |map| map.is_empty())
    }

    /// Insert the entries of one leaf.
    ///
    /// More than one pair means the leaf's nodes disagree on the physical
    /// key; those go under the branching marker.
    pub fn insert(&mut self, parts: &[PathPart], pairs: Vec<(String, Value)>, path: &str) -> Result<()> {
        let multi = pairs.len() > 1;
        let base_find = self.base_find.clone();

        if parts.is_empty() && !multi {
            let root = object_mut(&mut self.root, path)?;
            for (key, value) in &base_find {
                if !root.contains_key(key) {
                    root.insert(key.clone(), value.clone());
                }
            }
            return add_entries(root, pairs, &base_find, true, path);
        }

        let mut current = &mut self.root;
        for part in parts {
            current = match (part, current) {
                (PathPart::And, Value::Object(map)) => map
                    .entry("$and".to_string())
                    .or_insert_with(|| Value::Array(Vec::new())),
                (PathPart::Or(width), Value::Object(map)) => map
                    .entry("$or".to_string())
                    .or_insert_with(|| Value::Array(vec![Value::Null; *width])),
                (PathPart::Position(position), Value::Array(items)) => {
                    while items.len() <= *position {
                        items.push(Value::Null);
                    }
                    if items[*position].is_null() {
                        items[*position] = Value::Object(base_find.clone());
                    }
                    &mut items[*position]
                }
                _ => return Err(complex(path)),
            };
        }

        let branch = object_mut(current, path)?;
        if multi {
            log_trace!("branching index entry at {} across {} slots", path, pairs.len());
            let markers = branch
                .entry(BRANCHING_KEY.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let markers = object_mut(markers, path)?;
            add_entries(markers, pairs, &base_find, false, path)
        } else {
            add_entries(branch, pairs, &base_find, true, path)
        }
    }

    /// Compact, expand branching markers and report what the query holds.
    /// None when nothing was recorded.
    pub fn finish(self) -> Option<CompiledIndex> {
        let IndexEntries { mut root, base_find } = self;
        let mut pruned = false;
        prune(&mut root, &mut pruned);
        let mut has_branches = false;
        expand_branches(&mut root, &base_find, &mut has_branches);
        let slotted = has_slot_keys(&root);
        match root {
            Value::Object(query) if !query.is_empty() => Some(CompiledIndex {
                query,
                has_branches,
                slotted,
                pruned,
            }),
            _ => None,
        }
    }
}

fn complex(path: &str) -> CompileError {
    CompileError::conflict("complex indexed expression could not be resolved.", path)
}

fn object_mut<'v>(value: &'v mut Value, path: &str) -> Result<&'v mut Map<String, Value>> {
    value.as_object_mut().ok_or_else(|| complex(path))
}

fn add_entries(
    entries: &mut Map<String, Value>,
    pairs: Vec<(String, Value)>,
    base_find: &Map<String, Value>,
    fix_compound: bool,
    path: &str,
) -> Result<()> {
    for (key, value) in pairs {
        let overridable = base_find.contains_key(&key);
        match entries.get_mut(&key) {
            Some(current) if !overridable => match (current, value) {
                (Value::Object(current), Value::Object(insert)) => current.extend(insert),
                (Value::Object(_), _) | (_, Value::Object(_)) => return Err(complex(path)),
                (current, insert) => {
                    if !deep_equals(current, &insert) {
                        return Err(CompileError::conflict(
                            "double indexed expression could not be resolved.",
                            path,
                        ));
                    }
                }
            },
            _ => {
                entries.insert(key.clone(), value);
                if fix_compound {
                    compound_slot_fix(entries, &key);
                }
            }
        }
    }
    Ok(())
}

/// `$or` arrays missing a branch would narrow the query, so they are dropped;
/// `$and` arrays simply lose their empty positions.
fn prune(value: &mut Value, pruned: &mut bool) {
    match value {
        Value::Object(map) => {
            for item in map.values_mut() {
                prune(item, pruned);
            }
            let incomplete_or = map
                .get("$or")
                .and_then(Value::as_array)
                .map_or(false, |items| items.iter().any(Value::is_null));
            if incomplete_or {
                map.remove("$or");
                *pruned = true;
            }
            if let Some(Value::Array(items)) = map.get_mut("$and") {
                items.retain(|item| !item.is_null());
                if items.is_empty() {
                    map.remove("$and");
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                prune(item, pruned);
            }
        }
        _ => {}
    }
}

fn expand_branches(value: &mut Value, base_find: &Map<String, Value>, has_branches: &mut bool) {
    match value {
        Value::Object(map) => {
            for item in map.values_mut() {
                expand_branches(item, base_find, has_branches);
            }
            if let Some(Value::Object(markers)) = map.remove(BRANCHING_KEY) {
                *has_branches = true;
                let mut base = base_find.clone();
                if let Some(or) = map.remove("$or") {
                    base.insert("$or".to_string(), or);
                }
                let branches: Vec<Value> = markers
                    .into_iter()
                    .map(|(key, value)| {
                        let mut entry = base.clone();
                        entry.insert(key.clone(), value);
                        compound_slot_fix(&mut entry, &key);
                        Value::Object(entry)
                    })
                    .collect();
                map.insert("$or".to_string(), Value::Array(branches));
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                expand_branches(item, base_find, has_branches);
            }
        }
        _ => {}
    }
}

fn has_slot_keys(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, item)| key.starts_with("idx.") || has_slot_keys(item)),
        Value::Array(items) => items.iter().any(has_slot_keys),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn base() -> Map<String, Value> {
        json!({"org": 1, "object": "c_pet"}).as_object().unwrap().clone()
    }

    fn pair(key: &str, value: Value) -> Vec<(String, Value)> {
        vec![(key.to_string(), value)]
    }

    // ========== Top-level entries ==========

    #[test]
    fn test_top_level_entry_is_seeded_with_base_find() {
        let mut entries = IndexEntries::new(base());
        entries.insert(&[], pair("c_name", json!("a")), "c_name").unwrap();
        let index = entries.finish().unwrap();
        assert_eq!(
            Value::Object(index.query),
            json!({"org": 1, "object": "c_pet", "c_name": "a"})
        );
        assert!(!index.has_branches);
        assert!(!index.slotted);
    }

    #[test]
    fn test_base_find_keys_are_overridable() {
        let mut entries = IndexEntries::new(base());
        entries.insert(&[], pair("object", json!("c_other")), "object").unwrap();
        let index = entries.finish().unwrap();
        assert_eq!(index.query["object"], json!("c_other"));
    }

    #[test]
    fn test_object_values_merge() {
        let mut entries = IndexEntries::new(Map::new());
        entries.insert(&[], pair("c_age", json!({"$gt": 1})), "c_age").unwrap();
        entries.insert(&[], pair("c_age", json!({"$lt": 9})), "c_age").unwrap();
        let index = entries.finish().unwrap();
        assert_eq!(Value::Object(index.query), json!({"c_age": {"$gt": 1, "$lt": 9}}));
    }

    #[test]
    fn test_conflicting_values() {
        let mut entries = IndexEntries::new(Map::new());
        entries.insert(&[], pair("c_age", json!(1)), "c_age").unwrap();
        entries.insert(&[], pair("c_age", json!(1)), "c_age").unwrap();
        let err = entries.insert(&[], pair("c_age", json!(2)), "c_age").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.reason(), "double indexed expression could not be resolved.");

        let err = entries.insert(&[], pair("c_age", json!({"$gt": 1})), "c_age").unwrap_err();
        assert_eq!(err.reason(), "complex indexed expression could not be resolved.");
    }

    // ========== Logical paths ==========

    #[test]
    fn test_or_branches_follow_positions() {
        let mut entries = IndexEntries::new(base());
        let or = [PathPart::Or(2)];
        entries
            .insert(&[or[0], PathPart::Position(0)], pair("c_a", json!(1)), "$or.c_a")
            .unwrap();
        entries
            .insert(&[or[0], PathPart::Position(1)], pair("c_b", json!(2)), "$or.c_b")
            .unwrap();
        let index = entries.finish().unwrap();
        assert_eq!(
            Value::Object(index.query),
            json!({"$or": [
                {"org": 1, "object": "c_pet", "c_a": 1},
                {"org": 1, "object": "c_pet", "c_b": 2}
            ]})
        );
        assert!(!index.pruned);
    }

    #[test]
    fn test_or_missing_a_branch_is_dropped() {
        let mut entries = IndexEntries::new(Map::new());
        entries
            .insert(&[PathPart::Or(3), PathPart::Position(0)], pair("c_a", json!(1)), "c_a")
            .unwrap();
        entries
            .insert(&[PathPart::Or(3), PathPart::Position(2)], pair("c_c", json!(1)), "c_c")
            .unwrap();
        assert!(entries.finish().is_none());
    }

    #[test]
    fn test_and_positions_are_compacted() {
        let mut entries = IndexEntries::new(Map::new());
        entries
            .insert(&[PathPart::And, PathPart::Position(2)], pair("c_a", json!(1)), "c_a")
            .unwrap();
        let index = entries.finish().unwrap();
        assert_eq!(Value::Object(index.query), json!({"$and": [{"c_a": 1}]}));
    }

    // ========== Slots and branching ==========

    #[test]
    fn test_slot_keys() {
        assert_eq!(slot_key("u1"), "idx.d.u1.v");
        assert_eq!(slot_key("g2"), "idx.d.g2.v");
        assert_eq!(slot_key("i3"), "idx.d.i3");
    }

    #[test]
    fn test_compound_slot_fix() {
        let mut map = Map::new();
        compound_slot_fix(&mut map, "idx.d.u1.v");
        assert_eq!(map.get("idx.d.u1"), Some(&json!({"$exists": true})));
        let mut map = Map::new();
        compound_slot_fix(&mut map, "idx.d.i3");
        assert!(map.is_empty());
    }

    #[test]
    fn test_branching_expands_to_or_of_slots() {
        let mut entries = IndexEntries::new(base());
        entries
            .insert(
                &[],
                vec![
                    ("idx.d.i1".to_string(), json!(true)),
                    ("idx.d.i4".to_string(), json!(true)),
                ],
                "c_flag",
            )
            .unwrap();
        let index = entries.finish().unwrap();
        assert!(index.has_branches);
        assert!(index.slotted);
        assert_eq!(
            Value::Object(index.query),
            json!({"$or": [
                {"org": 1, "object": "c_pet", "idx.d.i1": true},
                {"org": 1, "object": "c_pet", "idx.d.i4": true}
            ]})
        );
    }

    #[test]
    fn test_branching_keeps_existing_or_inside_each_branch() {
        let mut entries = IndexEntries::new(Map::new());
        entries
            .insert(&[PathPart::Or(1), PathPart::Position(0)], pair("c_a", json!(1)), "c_a")
            .unwrap();
        entries
            .insert(
                &[],
                vec![
                    ("idx.d.u1.v".to_string(), json!("x")),
                    ("idx.d.u4.v".to_string(), json!("x")),
                ],
                "c_flag",
            )
            .unwrap();
        let index = entries.finish().unwrap();
        assert_eq!(
            Value::Object(index.query),
            json!({"$or": [
                {"$or": [{"c_a": 1}], "idx.d.u1.v": "x", "idx.d.u1": {"$exists": true}},
                {"$or": [{"c_a": 1}], "idx.d.u4.v": "x", "idx.d.u4": {"$exists": true}}
            ]})
        );
    }
}
