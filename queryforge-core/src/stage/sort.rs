// queryforge-core/src/stage/sort.rs
//! `$sort` stage
//!
//! Each field resolves to one sortable key. Custom-indexed properties sort
//! on their index slot, references on `_id`, everything else on the path
//! itself. While the pipeline is still index eligible, the keys together
//! with the base find and earlier match keys must line up with a native
//! index.

use super::matching::slot_key;
use super::{
    check_expression, filter_by_discriminators, is_shorthand_name, new_rooted_tree, normalize_stage_value,
    StageContext, StageKind, StageOutput,
};
use crate::error::{CompileError, Result};
use crate::log_trace;
use crate::property::{find_property, merge_and_intersect, CandidateProperty};
use crate::schema::{NodeId, TypeName};
use crate::tree::{ComponentId, RValue, Tree, ROOT};
use crate::value_utils::{collect_query_keys, normalize_property_path};
use serde_json::{json, Map, Value};

/// Compile one `$sort` stage value
pub fn compile(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    let tree = parse(&normalize(value)?, ctx)?;
    let fields: Vec<ComponentId> = match tree.component(ROOT).value {
        Some(root) => tree.children(root).to_vec(),
        None => Vec::new(),
    };

    let properties = resolve_properties(&tree, &fields, ctx)?;

    let mut sort = Map::new();
    let mut checks = Vec::new();
    for c in &fields {
        let key = sort_key(&tree, *c, &properties, ctx, &mut checks)?;
        let direction = match tree.component_rvalue(*c) {
            Some(RValue::Variable(name)) => Value::String(format!("{{{{{}}}}}", name)),
            Some(RValue::Simple(v)) => v.clone(),
            _ => return Err(invalid_direction(&tree, *c)),
        };
        sort.insert(key, direction);
    }
    let sort = Value::Object(sort);
    check_native_indexes(ctx, &sort, &checks)?;

    let mut index_keys = Vec::new();
    collect_query_keys(&sort, &mut index_keys);

    Ok(StageOutput {
        json: json!({ "$sort": sort }),
        models: ctx.input_models.clone(),
        properties,
        projection: None,
        variables: tree.variables(),
        expansions: Vec::new(),
        index_keys,
    })
}

// ============================================================================
// PARSING
// ============================================================================

/// `"c_name"` sorts ascending; an array of single-field objects is merged
/// in order
fn normalize(value: &Value) -> Result<Map<String, Value>> {
    match value {
        Value::String(s) if is_shorthand_name(s, false) => {
            let mut map = Map::new();
            map.insert(s.clone(), json!(1));
            Ok(map)
        }
        Value::Array(items) => {
            let mut map = Map::new();
            for item in items {
                match item {
                    Value::Object(object) => map.extend(object.clone()),
                    _ => {
                        return Err(CompileError::invalid(
                            "Object expected for $sort expression",
                            "",
                        ))
                    }
                }
            }
            Ok(map)
        }
        other => normalize_stage_value(StageKind::Sort, other),
    }
}

fn parse(map: &Map<String, Value>, ctx: &StageContext<'_, '_>) -> Result<Tree> {
    let (mut tree, root) = new_rooted_tree(StageKind::Sort);
    let object = Value::Object(map.clone());
    check_expression(&tree, ROOT, &object, &ctx.limits)?;

    for (key, value) in map {
        if key.starts_with('$') || normalize_property_path(key) != *key {
            return Err(CompileError::invalid(format!("Invalid field name: ({})", key), key.clone()));
        }
        let c = tree.add_component(root, key);
        tree.push_child(root, c);

        let rvalue = if let Some(name) = ctx.variable(value) {
            RValue::Variable(name)
        } else {
            match value.as_f64() {
                Some(d) if d == 1.0 => RValue::Simple(json!(1)),
                Some(d) if d == -1.0 => RValue::Simple(json!(-1)),
                _ => return Err(invalid_direction(&tree, c)),
            }
        };
        let v = tree.add_value(c, rvalue);
        tree.set_component_value(c, v);
    }
    Ok(tree)
}

fn invalid_direction(tree: &Tree, c: ComponentId) -> CompileError {
    CompileError::invalid(
        "Sort value must be 1 for ascending, or -1 for descending order",
        tree.component(c).fullpath.clone(),
    )
}

// ============================================================================
// PROPERTIES
// ============================================================================

fn resolve_properties(
    tree: &Tree,
    fields: &[ComponentId],
    ctx: &StageContext<'_, '_>,
) -> Result<Vec<CandidateProperty>> {
    let mut groups = Vec::with_capacity(fields.len());
    for c in fields {
        let component = tree.component(*c);
        let path = &component.property_fullpath;
        let mut properties = ctx.input_properties.clone();
        if find_property(&properties, path).is_none() {
            let nodes = filter_by_discriminators(ctx, ctx.catalog.gather_nodes(&ctx.input_models, path));
            if nodes.is_empty() && ctx.strict() {
                return Err(CompileError::invalid(
                    "strict: there are no properties that could be sorted.",
                    component.fullpath.clone(),
                ));
            }
            properties.push(CandidateProperty::new(path.clone(), nodes));
        }
        groups.push(properties);
    }
    merge_and_intersect(groups)
}

// ============================================================================
// VALIDATION AND KEYS
// ============================================================================

/// Validate one field and pick the key it sorts on. Nodes needing a native
/// index are queued on `checks`.
fn sort_key(
    tree: &Tree,
    c: ComponentId,
    properties: &[CandidateProperty],
    ctx: &StageContext<'_, '_>,
    checks: &mut Vec<(String, NodeId)>,
) -> Result<String> {
    let catalog = ctx.catalog;
    let component = tree.component(c);
    let fullpath = component.fullpath.clone();
    let property = find_property(properties, &component.property_fullpath)
        .ok_or_else(|| CompileError::invalid("Cannot sort by unreconciled field.", fullpath.clone()))?;

    // documents inside arrays sort as arrays too
    let is_array = property.is_array.unwrap_or_else(|| {
        property
            .nodes
            .iter()
            .any(|n| catalog.lineage(*n).iter().any(|a| catalog.node(*a).array))
    });
    if is_array {
        return Err(CompileError::invalid("Array sorting is unsupported.", fullpath));
    }

    let mut references = 0;
    let mut native = 0;
    let mut slot: Option<(String, bool)> = None;

    for id in &property.nodes {
        let node = catalog.node(*id);
        if node.type_name == TypeName::Reference {
            references += 1;
        }
        for ancestor in catalog.lineage(*id) {
            ctx.authorize(ancestor, true)?;
            let n = catalog.node(ancestor);
            if n.is_reader_backed() {
                return Err(CompileError::invalid(
                    format!(
                        "Sorting cannot occur on properties not backed by concrete data ({})",
                        n.fqpp
                    ),
                    fullpath,
                ));
            }
        }
        if !node.is_primitive() && node.type_name != TypeName::Reference {
            return Err(CompileError::invalid(
                "Sorting can only occur on primitive values",
                fullpath,
            ));
        }

        if ctx.uses_index {
            if node.native_index {
                native += 1;
            }
            if node.indexed {
                let name = node.slot.clone().ok_or_else(|| {
                    CompileError::invalid(format!("Sort failed to load index for {}", node.fqpp), fullpath.clone())
                })?;
                match &slot {
                    None => slot = Some((name, node.localized)),
                    Some((current, _)) if *current != name => {
                        return Err(CompileError::invalid(
                            "Sorting cannot occur across similarly named custom properties.",
                            fullpath,
                        ));
                    }
                    Some(_) => {}
                }
            } else if !node.native_index && !ctx.options.unindexed {
                checks.push((fullpath.clone(), *id));
            }
        }
    }

    if native > 0 && native < property.nodes.len() {
        return Err(CompileError::invalid(
            "Native properties can only sorted when they are all indexed.",
            fullpath,
        ));
    }
    if references > 0 && references < property.nodes.len() && slot.is_none() {
        return Err(CompileError::invalid(
            "Sorting cannot occur on a reference when mixed with other types. Consider sorting by the reference _id or creating a common field that holds the referenced _id as an indexed ObjectId.",
            fullpath,
        ));
    }

    let key = match slot {
        Some((name, localized)) => {
            let key = slot_key(&name);
            if localized {
                format!("{}.{}", key, ctx.options.current_locale)
            } else {
                key
            }
        }
        None if references > 0 => format!("{}._id", tree.key(c)),
        None => tree.key(c).to_string(),
    };
    Ok(key)
}

/// Sort keys, base find keys and earlier match keys must walk a native index
/// down to every queued node
fn check_native_indexes(ctx: &StageContext<'_, '_>, sort: &Value, checks: &[(String, NodeId)]) -> Result<()> {
    if !ctx.uses_index || checks.is_empty() {
        return Ok(());
    }
    let catalog = ctx.catalog;
    let check_paths: Vec<String> = checks.iter().map(|(_, id)| catalog.node(*id).fullpath.clone()).collect();

    let mut keys = Vec::new();
    collect_query_keys(&Value::Object(ctx.base_find()), &mut keys);
    collect_query_keys(sort, &mut keys);
    for key in &ctx.prior_index_keys {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }

    let covered = ctx.index_tree().covered(&keys, &check_paths);
    log_trace!("sort index coverage {:?} of {:?}", covered, check_paths);
    for (fullpath, id) in checks {
        let node = catalog.node(*id);
        if !covered.contains(&node.fullpath) {
            return Err(CompileError::invalid(
                format!(
                    "Sorting can only occur on indexed properties. {} is either not indexed or is missing a preceding index key.",
                    node.fqpp
                ),
                fullpath.clone(),
            ));
        }
    }
    Ok(())
}
