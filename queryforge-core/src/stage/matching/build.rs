// queryforge-core/src/stage/matching/build.rs
// $match build: natural query, index entries and the native index post-check

use super::index_entries::{slot_key, PathPart};
use super::operators::MatchOp;
use super::MatchStage;
use crate::error::{CompileError, Result};
use crate::schema::cast_for_query;
use crate::tree::{merge_built, Built, ComponentId, RValue, ValueId, ROOT};
use crate::value_utils::{canonical_json_string, collect_query_keys, deep_equals};
use crate::{log_debug, log_trace};
use ahash::AHashSet;
use serde_json::{json, Map, Value};

/// What the enclosing expression has accumulated so far
struct Enclosing<'b> {
    map: &'b Map<String, Value>,
    replacement: Option<&'b Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caster {
    /// Cast into the node's stored type
    Schema,
    /// `$exists`: truthiness
    Boolean,
}

fn placeholder(name: &str) -> Value {
    Value::String(format!("{{{{{}}}}}", name))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn typed_expression_error(path: &str) -> CompileError {
    CompileError::unsupported("Query expressions against multiple typed properties are not supported.", path)
}

/// Dotted leaf paths of a built value, array positions included
fn flatten_keys(value: &Value, prefix: &str, out: &mut Vec<String>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                flatten_keys(item, &join(key), out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_keys(item, &join(&i.to_string()), out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

impl MatchStage<'_, '_, '_> {
    /// Natural query, replaced or `$and`ed with the index entry query
    pub(super) fn build(&self) -> Result<Value> {
        let root = self.value_id(ROOT)?;
        let mut natural = match self.build_expression(root)?.map(Built::into_value) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in self.ctx.base_find() {
            if !natural.contains_key(&key) {
                natural.insert(key, value);
            }
        }

        let entries = self.entries.replace(super::IndexEntries::new(Map::new()));
        let query = match entries.finish() {
            None => Value::Object(natural),
            Some(index) => {
                let complete = self.index_complete.get();
                log_debug!(
                    "$match stage {} index: branches={} slotted={} pruned={} complete={}",
                    self.ctx.position,
                    index.has_branches,
                    index.slotted,
                    index.pruned,
                    complete
                );
                if index.has_branches || index.slotted || index.pruned || !complete {
                    json!({ "$and": [Value::Object(natural), Value::Object(index.query)] })
                } else {
                    Value::Object(index.query)
                }
            }
        };

        self.check_native_indexes(&query)?;
        Ok(query)
    }

    fn build_expression(&self, expression: ValueId) -> Result<Option<Built>> {
        let mut map = Map::new();
        let mut replacement: Option<Value> = None;
        for child in self.tree.children(expression) {
            let built = self.build_component(
                *child,
                &Enclosing {
                    map: &map,
                    replacement: replacement.as_ref(),
                },
            )?;
            match built {
                None => {}
                Some(built @ Built::Replace(_)) => replacement = Some(built.into_value()),
                Some(Built::Value(Value::Object(object))) => match replacement.as_mut() {
                    Some(Value::Object(current)) => merge_built(current, object),
                    _ => merge_built(&mut map, object),
                },
                Some(Built::Value(_)) => {}
            }
        }
        Ok(match replacement {
            Some(value) => Some(Built::replace(value)),
            None if map.is_empty() => None,
            None => Some(Built::Value(Value::Object(map))),
        })
    }

    fn build_component(&self, c: ComponentId, enclosing: &Enclosing<'_>) -> Result<Option<Built>> {
        if let Some(op) = self.op(c) {
            return self.build_operator(c, op, enclosing);
        }
        let value = self.value_id(c)?;
        let key = self.build_key(c);
        match self.tree.rvalue(value) {
            RValue::Expression(_) => {
                let built = match self.build_expression(value)? {
                    None => return Ok(None),
                    Some(built) => built,
                };
                if built.is_replacement() {
                    return Ok(Some(Built::Value(built.into_value())));
                }
                let result = built.into_value();
                Ok(Some(Built::Value(match self.localized(c, vec![result.clone()], "$in")? {
                    Some(localized) => localized,
                    None => json!({ key: result }),
                })))
            }
            RValue::Simple(_) => {
                let values = self.cast_into_query(c, &|v| v, Caster::Schema)?;
                if let Some(localized) = self.localized(c, values.clone(), "$in")? {
                    return Ok(Some(Built::Value(localized)));
                }
                let value = if values.len() == 1 {
                    values.into_iter().next().unwrap_or(Value::Null)
                } else {
                    json!({ "$in": values })
                };
                Ok(Some(Built::Value(json!({ key: value }))))
            }
            RValue::Variable(name) => {
                self.mark_incomplete();
                Ok(Some(Built::Value(json!({ key: placeholder(name) }))))
            }
            RValue::Array(_) => Err(super::exact_matching(&self.tree, c)),
            _ => Err(CompileError::invalid("Unknown match value type.", self.fullpath(c))),
        }
    }

    fn build_operator(&self, c: ComponentId, op: MatchOp, enclosing: &Enclosing<'_>) -> Result<Option<Built>> {
        let value = self.value_id(c)?;
        let key = op.key();
        let path = self.fullpath(c);

        if let RValue::Variable(name) = self.tree.rvalue(value) {
            self.mark_incomplete();
            return Ok(Some(Built::Value(json!({ key: placeholder(name) }))));
        }
        if op.is_simple() {
            return self.build_simple(c, op, enclosing);
        }
        if enclosing.replacement.is_some() && !matches!(op, MatchOp::And | MatchOp::Or) {
            return Err(typed_expression_error(&path));
        }

        let built = match op {
            MatchOp::Type | MatchOp::Size => {
                self.mark_incomplete();
                json!({ key: self.tree.underlying(value) })
            }
            MatchOp::Nin => {
                if self.tree.elements(value).is_empty() {
                    self.mark_incomplete();
                    json!({ "$nin": [] })
                } else {
                    let values = self.cast_into_query(c, &|v| json!({ "$nin": v }), Caster::Schema)?;
                    json!({ "$nin": values })
                }
            }
            MatchOp::In => {
                if self.tree.elements(value).is_empty() {
                    self.mark_incomplete();
                    json!({ "$in": [] })
                } else {
                    let values = self.cast_into_query(c, &|v| json!({ "$in": v }), Caster::Schema)?;
                    if let Some(localized) = self.localized(self.parent(c), values.clone(), "$in")? {
                        return Ok(Some(Built::replace(localized)));
                    }
                    json!({ "$in": values })
                }
            }
            MatchOp::And | MatchOp::Or => {
                let mut items = Vec::new();
                for element in self.tree.elements(value) {
                    items.push(self.build_element(*element)?);
                }
                json!({ key: items })
            }
            MatchOp::Regex => {
                let mut values = self.cast_into_query(c, &|v| v, Caster::Schema)?;
                if values.len() > 1 {
                    return Err(CompileError::invalid("$regex cannot match against non-string properties.", path));
                }
                values.pop().unwrap_or_else(|| self.tree.underlying(value))
            }
            MatchOp::All => {
                let expressions = self
                    .tree
                    .elements(value)
                    .iter()
                    .any(|e| matches!(self.tree.rvalue(*e), RValue::Expression(_)));
                if expressions {
                    self.mark_incomplete();
                    let mut items = Vec::new();
                    for element in self.tree.elements(value) {
                        items.push(self.build_element(*element)?);
                    }
                    json!({ "$all": items })
                } else {
                    let values = self.cast_into_query(c, &|v| json!({ "$all": v }), Caster::Schema)?;
                    if let Some(localized) = self.localized(c, values.clone(), "$all")? {
                        return Ok(Some(Built::replace(localized)));
                    }
                    json!({ "$all": values })
                }
            }
            MatchOp::ElemMatch => return self.build_elem_match(c, value),
            MatchOp::Within => {
                self.cast_into_query(c, &|v| json!({ "$geoWithin": v }), Caster::Schema)?;
                json!({ "$geoWithin": self.tree.underlying(value) })
            }
            _ => return Err(CompileError::invalid("Unknown match value type.", path)),
        };
        Ok(Some(Built::Value(built)))
    }

    fn build_element(&self, element: ValueId) -> Result<Value> {
        match self.tree.rvalue(element) {
            RValue::Expression(_) => Ok(self
                .build_expression(element)?
                .map(Built::into_value)
                .unwrap_or_else(|| Value::Object(Map::new()))),
            RValue::Variable(name) => {
                self.mark_incomplete();
                Ok(placeholder(name))
            }
            _ => Ok(self.tree.underlying(element)),
        }
    }

    /// Comparison and `$exists` operators. Property nodes casting to more
    /// than one value fan out into an `$or` that replaces the enclosing
    /// expression.
    fn build_simple(&self, c: ComponentId, op: MatchOp, enclosing: &Enclosing<'_>) -> Result<Option<Built>> {
        let key = op.key();
        let caster = if op == MatchOp::Exists { Caster::Boolean } else { Caster::Schema };
        let values = self.cast_into_query(c, &|v| json!({ key: v }), caster)?;
        if values.len() == 1 {
            return Ok(Some(Built::Value(json!({ key: values[0] }))));
        }

        let path = self.fullpath(c);
        if !enclosing.map.is_empty() && enclosing.replacement.is_none() {
            return Err(typed_expression_error(&path));
        }
        let parent_key = self.build_key(self.parent(c));
        if let Some(Value::Object(replacement)) = enclosing.replacement {
            if let Some(Value::Array(branches)) = replacement.get("$or") {
                if branches.len() == values.len() {
                    let mut branches = branches.clone();
                    for (branch, value) in branches.iter_mut().zip(values) {
                        if let Some(branch) = branch.as_object_mut() {
                            let entry = branch
                                .entry(parent_key.clone())
                                .or_insert_with(|| Value::Object(Map::new()));
                            if let Some(entry) = entry.as_object_mut() {
                                entry.insert(key.to_string(), value);
                            }
                        }
                    }
                    let mut merged = replacement.clone();
                    merged.insert("$or".to_string(), Value::Array(branches));
                    return Ok(Some(Built::replace(Value::Object(merged))));
                }
            }
        }
        let branches: Vec<Value> = values
            .into_iter()
            .map(|value| json!({ parent_key.clone(): { key: value } }))
            .collect();
        Ok(Some(Built::replace(json!({ "$or": branches }))))
    }

    fn build_elem_match(&self, c: ComponentId, value: ValueId) -> Result<Option<Built>> {
        self.mark_incomplete();
        let values = self
            .build_expression(value)?
            .map(Built::into_value)
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut keys = Vec::new();
        flatten_keys(&values, "", &mut keys);
        let localized: Vec<&String> = keys
            .iter()
            .filter(|k| k.contains("locales.") && !k.contains("$elemMatch.locale"))
            .collect();
        if localized.is_empty() {
            return Ok(Some(Built::Value(json!({ "$elemMatch": values }))));
        }
        let top_level = values.as_object().map_or(0, Map::len);
        if localized.len() < keys.len() && top_level > 1 {
            return Err(CompileError::invalid(
                "Localized properties cannot be mixed with none localized properties on $elemMatch",
                self.fullpath(c),
            ));
        }
        Ok(Some(Built::replace(values)))
    }

    // ========================================================================
    // CASTING AND INDEX ENTRIES
    // ========================================================================

    /// Cast `c`'s value(s) for every candidate node, returning the distinct
    /// casts. Index entries are recorded along the way: custom slots per
    /// node, natural keys otherwise.
    fn cast_into_query(&self, c: ComponentId, format: &dyn Fn(Value) -> Value, caster: Caster) -> Result<Vec<Value>> {
        let path = self.fullpath(c);
        let value = self.value_id(c)?;
        let (raw, is_array): (Vec<(Value, bool)>, bool) = match self.tree.rvalue(value) {
            RValue::Array(elements) => (
                elements
                    .iter()
                    .map(|e| match self.tree.rvalue(*e) {
                        RValue::Variable(name) => (placeholder(name), true),
                        _ => (self.tree.underlying(*e), false),
                    })
                    .collect(),
                true,
            ),
            RValue::Variable(name) => (vec![(placeholder(name), true)], false),
            _ => (vec![(self.tree.underlying(value), false)], false),
        };
        let has_variables = raw.iter().any(|(_, variable)| *variable);
        if has_variables {
            self.mark_incomplete();
        }

        let property = self
            .property(c)?
            .ok_or_else(|| CompileError::invalid("Cannot match by unreconciled field.", path.clone()))?;
        if property.nodes.is_empty() {
            return Ok(raw.into_iter().map(|(v, _)| v).collect());
        }

        let catalog = self.ctx.catalog;
        let named = self.named_component(c);
        let mut values: Vec<Value> = Vec::new();
        let mut seen: AHashSet<String> = AHashSet::new();
        let mut slotted: Vec<(String, Value)> = Vec::new();

        for id in &property.nodes {
            let node = catalog.node(*id);
            let mut casted = Vec::with_capacity(raw.len());
            for (v, variable) in &raw {
                let cast = if *variable {
                    v.clone()
                } else {
                    match caster {
                        Caster::Schema => cast_for_query(node, v, &path)?,
                        Caster::Boolean => Value::Bool(truthy(v)),
                    }
                };
                if seen.insert(canonical_json_string(&cast)) {
                    values.push(cast.clone());
                }
                casted.push(cast);
            }

            if !self.ctx.uses_index || has_variables {
                continue;
            }
            let entry = if is_array {
                Value::Array(casted)
            } else {
                casted.into_iter().next().unwrap_or(Value::Null)
            };
            match (&node.slot, node.indexed) {
                (Some(slot), true) => {
                    let mut key = slot_key(slot);
                    if node.localized {
                        key = format!("{}.{}", key, self.ctx.options.current_locale);
                    }
                    let entry = format(entry);
                    if !slotted.iter().any(|(k, v)| *k == key && deep_equals(v, &entry)) {
                        slotted.push((key, entry));
                    }
                }
                _ => self.add_index_entries(named, vec![(self.index_key(named), format(entry))])?,
            }
        }

        if !slotted.is_empty() {
            self.add_index_entries(named, slotted)?;
        }
        if values.len() > raw.len() {
            // nodes disagree on the cast; per-node entries no longer mirror the query
            self.mark_incomplete();
        }
        Ok(values)
    }

    fn add_index_entries(&self, named: ComponentId, pairs: Vec<(String, Value)>) -> Result<()> {
        let parts = self.index_path(named);
        log_trace!("index entries for {} at {:?}", self.fullpath(named), parts);
        self.entries.borrow_mut().insert(&parts, pairs, &self.fullpath(named))
    }

    /// Logical ancestors of `named` as entry tree steps
    fn index_path(&self, named: ComponentId) -> Vec<PathPart> {
        let mut chain = Vec::new();
        let mut current = self.tree.parent_component(named);
        while let Some(c) = current {
            if self.tree.is_root(c) {
                break;
            }
            if self.tree.is_operator(c) && MatchOp::is_logical(self.tree.key(c)) {
                chain.push(c);
            }
            current = self.tree.parent_component(c);
        }
        chain.reverse();
        chain.push(named);

        let mut parts = Vec::new();
        for (i, c) in chain.iter().enumerate() {
            if i > 0 {
                let ancestor = chain[i - 1];
                let mut step = Some(*c);
                while let Some(s) = step {
                    if self.tree.parent_component(s) == Some(ancestor) {
                        break;
                    }
                    step = self.tree.parent_component(s);
                }
                if let Some(parent) = step.and_then(|s| self.tree.component(s).parent) {
                    parts.push(PathPart::Position(self.tree.value(parent).position));
                }
            }
            if i + 1 < chain.len() {
                let width = self
                    .tree
                    .component(*c)
                    .value
                    .map_or(0, |v| self.tree.elements(v).len());
                parts.push(if self.tree.key(*c) == "$or" {
                    PathPart::Or(width)
                } else {
                    PathPart::And
                });
            }
        }
        parts
    }

    // ========================================================================
    // LOCALIZATION
    // ========================================================================

    /// Rewrite a match on localized nodes into `locales.*` element matches.
    /// None when no candidate node is localized.
    fn localized(&self, c: ComponentId, values: Vec<Value>, op: &str) -> Result<Option<Value>> {
        let property = match self.property(c)? {
            Some(property) => property,
            None => return Ok(None),
        };
        let catalog = self.ctx.catalog;
        if !property.nodes.iter().any(|n| catalog.node(*n).localized) {
            return Ok(None);
        }
        self.mark_incomplete();

        let expression = if values.len() == 1 {
            values.into_iter().next().unwrap_or(Value::Null)
        } else {
            json!({ op: values })
        };
        let first = catalog.node(property.nodes[0]);
        let locale = first
            .fixed_locale
            .clone()
            .unwrap_or_else(|| self.ctx.options.current_locale.clone());
        let path = &self.tree.component(c).property_fullpath;
        let locales_key = format!("locales.{}", path);
        let element_match = json!({ "$elemMatch": { "value": expression.clone(), "locale": locale } });

        if property.nodes.len() == 1 {
            return Ok(Some(json!({ locales_key: element_match })));
        }
        let branches: Vec<Value> = property
            .nodes
            .iter()
            .map(|id| {
                let node = catalog.node(*id);
                let mut branch = Map::new();
                if node.localized {
                    branch.insert(locales_key.clone(), element_match.clone());
                } else {
                    branch.insert(path.clone(), expression.clone());
                }
                if let Some(type_name) = &catalog.node_model(*id).type_name {
                    branch.insert("type".to_string(), Value::String(type_name.clone()));
                }
                Value::Object(branch)
            })
            .collect();
        Ok(Some(json!({ "$or": branches })))
    }

    // ========================================================================
    // NATIVE INDEX POST-CHECK
    // ========================================================================

    /// Unindexed properties matched in an index-eligible pipeline must sit
    /// behind a native index prefix the final query satisfies.
    fn check_native_indexes(&self, query: &Value) -> Result<()> {
        let checks = self.native_checks.borrow();
        if !self.ctx.uses_index || checks.is_empty() {
            return Ok(());
        }
        let catalog = self.ctx.catalog;
        let check_paths: Vec<String> = checks.iter().map(|(_, id)| catalog.node(*id).fullpath.clone()).collect();

        let mut keys = Vec::new();
        collect_query_keys(query, &mut keys);
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| {
                check_paths
                    .iter()
                    .find(|p| key.starts_with(&format!("{}.", p)))
                    .cloned()
                    .unwrap_or(key)
            })
            .collect();

        let covered = self.ctx.index_tree().covered(&keys, &check_paths);
        log_trace!("native index coverage {:?} of {:?}", covered, check_paths);
        for (c, id) in checks.iter() {
            let node = catalog.node(*id);
            if !covered.contains(&node.fullpath) {
                return Err(CompileError::invalid(
                    format!(
                        "Matches can only occur on indexed properties. {} is either not indexed or is missing a preceding index key.",
                        node.fqpp
                    ),
                    self.fullpath(*c),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!("false")));
        assert!(truthy(&json!({})));
    }

    #[test]
    fn test_flatten_keys() {
        let mut keys = Vec::new();
        flatten_keys(
            &json!({"locales.c_title": {"$elemMatch": {"value": "a", "locale": "en_US"}}, "c_x": [1, 2]}),
            "",
            &mut keys,
        );
        assert_eq!(
            keys,
            vec![
                "locales.c_title.$elemMatch.value",
                "locales.c_title.$elemMatch.locale",
                "c_x.0",
                "c_x.1"
            ]
        );
    }

    #[test]
    fn test_placeholder() {
        assert_eq!(placeholder("name"), json!("{{name}}"));
    }
}
