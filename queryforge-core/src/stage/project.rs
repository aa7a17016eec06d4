// queryforge-core/src/stage/project.rs
// `$project` and `$addFields` stages

use super::expression::{check_fields_or_operator, fill_expression, PipelineExpression};
use super::{
    check_expression, is_shorthand_name, new_rooted_tree, normalize_stage_value, Projection, StageContext,
    StageKind, StageOutput,
};
use crate::error::{CompileError, Result};
use crate::schema::ProjectedNode;
use crate::tree::{Tree, ROOT};
use crate::value_utils::{collapse_included_paths, expand_dotted_keys, flatten_projection, is_inclusion};
use serde_json::{json, Map, Value};

/// Compile one `$project` or `$addFields` stage value
pub fn compile(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    let expression = PipelineExpression::new(ctx, parse(value, ctx)?);
    let nodes = expression.generate()?;
    let mut body = expression.build()?;

    let extends_input = ctx.kind == StageKind::AddFields;
    if !extends_input {
        body = add_dependencies(flatten_projection(&body), &nodes, ctx)?;
        body = collapse_included_paths(body);
    }

    let key = ctx.kind.key();
    Ok(StageOutput {
        json: json!({ key: body }),
        models: ctx.input_models.clone(),
        properties: Vec::new(),
        projection: Some(Projection { nodes, extends_input }),
        variables: expression.tree().variables(),
        expansions: expression.expansions(),
        index_keys: Vec::new(),
    })
}

fn parse(value: &Value, ctx: &StageContext<'_, '_>) -> Result<Tree> {
    let map = match value {
        Value::String(s) if is_shorthand_name(s, true) => {
            let mut map = Map::new();
            map.insert(s.clone(), json!(1));
            map
        }
        other => normalize_stage_value(ctx.kind, other)?,
    };
    let map = expand_dotted_keys(&map);

    let (mut tree, root) = new_rooted_tree(ctx.kind);
    let object = Value::Object(map);
    let map = check_expression(&tree, ROOT, &object, &ctx.limits)?;
    if let Some(op) = map.keys().find(|k| k.starts_with('$')) {
        return Err(CompileError::invalid(
            "pipeline expressions do not support operators at the top level.",
            op.clone(),
        ));
    }
    check_fields_or_operator(ctx.kind, map, true, "")?;

    let mut fields = Map::new();
    if ctx.kind == StageKind::Project {
        match map.get("_id") {
            Some(id) if !is_inclusion(id) => {
                return Err(CompileError::invalid(
                    "pipeline expression _id field can only be 1 or true.",
                    "_id",
                ))
            }
            Some(_) => {}
            None => {
                fields.insert("_id".to_string(), json!(1));
            }
        }
    }
    fields.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));

    fill_expression(&mut tree, ctx, root, &fields)?;
    Ok(tree)
}

/// Select what the projected sources depend on. A dependency the projection
/// already computes differently cannot be satisfied.
fn add_dependencies(
    mut body: Map<String, Value>,
    nodes: &[ProjectedNode],
    ctx: &StageContext<'_, '_>,
) -> Result<Map<String, Value>> {
    for node in nodes {
        for dependency in node.dependencies(ctx.catalog) {
            match body.get(&dependency) {
                Some(existing) if !is_inclusion(existing) => {
                    return Err(CompileError::invalid(
                        "A required dependency has been excluded or renamed.",
                        dependency,
                    ));
                }
                Some(_) => {}
                None => {
                    body.insert(dependency, json!(1));
                }
            }
        }
    }
    Ok(body)
}
