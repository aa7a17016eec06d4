// queryforge-core/src/schema/indexes.rs
// Native collection index introspection

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A native index as declared on a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    /// Ordered key fields; compound indexes list more than one
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        IndexDefinition {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }
}

/// Supplies the native indexes of a collection
pub trait IndexCatalog {
    fn collection_indexes(&self, collection: &str) -> Vec<IndexDefinition>;
}

/// Prefix tree over every index's key sequence.
///
/// A path is covered when it can be reached from the root by stepping only
/// through keys that the query itself uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTree {
    children: BTreeMap<String, IndexTree>,
}

impl IndexTree {
    pub fn from_indexes(indexes: &[IndexDefinition]) -> Self {
        let mut tree = IndexTree::default();
        for index in indexes {
            let mut branch = &mut tree;
            for field in &index.fields {
                branch = branch.children.entry(field.clone()).or_default();
            }
        }
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Which of `checks` are reachable through `keys`
    pub fn covered(&self, keys: &[String], checks: &[String]) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut used = Vec::with_capacity(keys.len());
        self.find(keys, checks, &mut used, &mut found);
        found
    }

    fn find(
        &self,
        keys: &[String],
        checks: &[String],
        used: &mut Vec<usize>,
        found: &mut HashSet<String>,
    ) {
        if found.len() == checks.len() {
            return;
        }
        for (pos, key) in keys.iter().enumerate() {
            if used.contains(&pos) {
                continue;
            }
            if let Some(branch) = self.children.get(key) {
                if checks.contains(key) {
                    found.insert(key.clone());
                }
                used.push(pos);
                branch.find(keys, checks, used, found);
                used.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn tree() -> IndexTree {
        IndexTree::from_indexes(&[
            IndexDefinition::new("object_created", strings(&["org", "object", "created"])),
            IndexDefinition::new("object_type_name", strings(&["org", "object", "type", "c_name"])),
        ])
    }

    #[test]
    fn test_covered_along_prefix() {
        let found = tree().covered(
            &strings(&["org", "object", "created"]),
            &strings(&["created"]),
        );
        assert!(found.contains("created"));
    }

    #[test]
    fn test_missing_preceding_key_is_not_covered() {
        let found = tree().covered(&strings(&["org", "object", "c_name"]), &strings(&["c_name"]));
        assert!(found.is_empty());

        let found = tree().covered(
            &strings(&["c_name", "type", "object", "org"]),
            &strings(&["c_name"]),
        );
        assert!(found.contains("c_name"));
    }

    #[test]
    fn test_compound_flag() {
        assert!(IndexDefinition::new("a", strings(&["a", "b"])).is_compound());
        assert!(!IndexDefinition::new("a", strings(&["a"])).is_compound());
    }
}
