// queryforge-core/src/stage/group.rs
// `$group` stage

use super::expression::{parse_expression, parse_simple_or_expression, Accumulator, PipelineExpression};
use super::{check_expression, is_shorthand_name, new_rooted_tree, normalize_stage_value, Projection, Slot, StageContext, StageOutput};
use crate::error::{CompileError, Result};
use crate::limits::{FIELD_NAME_PATTERN, FIELD_NAME_REGEX};
use crate::rules::{check_all, RuleInput};
use crate::schema::{ProjectedNode, TypeName};
use crate::tree::{ComponentId, RValue, Tree, ValueId};
use crate::value_utils::expand_dotted_keys;
use serde_json::{json, Map, Value};

pub fn compile(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    let expression = PipelineExpression::new(ctx, parse(value, ctx)?);
    let mut nodes = expression.generate()?;
    let mut body = expression.build()?;

    // keep grouped output self-describing for later stages
    if !body.contains_key("object") {
        let object = match body.get("_id").and_then(|id| id.get("object")) {
            Some(Value::String(s)) if s == "$object" => json!({ "$first": "$object" }),
            _ => json!({ "$first": { "$literal": ctx.options.object } }),
        };
        body.insert("object".to_string(), object);
        nodes.push(string_node("object"));
    }
    if !body.contains_key("type") {
        let type_field = match body.get("_id").and_then(|id| id.get("type")) {
            Some(Value::String(s)) if s == "$type" => Some(json!({ "$first": "$type" })),
            _ => ctx.catalog.agreed_type_name(&ctx.input_models).map(|t| json!({ "$first": { "$literal": t } })),
        };
        if let Some(type_field) = type_field {
            body.insert("type".to_string(), type_field);
            nodes.push(string_node("type"));
        }
    }

    Ok(StageOutput {
        json: json!({ "$group": body }),
        models: ctx.input_models.clone(),
        properties: Vec::new(),
        projection: Some(Projection { nodes, extends_input: false }),
        variables: expression.tree().variables(),
        expansions: expression.expansions(),
        index_keys: Vec::new(),
    })
}

fn string_node(name: &str) -> ProjectedNode {
    ProjectedNode::new(name).typed(TypeName::String).with_array(Some(false))
}

fn parse(value: &Value, ctx: &StageContext<'_, '_>) -> Result<Tree> {
    let map = match value {
        Value::String(s) if is_shorthand_name(s, false) => {
            let mut map = Map::new();
            map.insert("_id".to_string(), Value::String(s.clone()));
            map
        }
        other => normalize_stage_value(ctx.kind, other)?,
    };
    let map = expand_dotted_keys(&map);

    match map.get("_id") {
        None => {
            return Err(CompileError::invalid("$group expression must contain an _id field", ""));
        }
        Some(Value::Null) if map.len() == 1 => {
            return Err(CompileError::invalid(
                "Group component requires at least one expression when grouping by null",
                "",
            ));
        }
        Some(_) => {}
    }

    let (mut tree, root) = new_rooted_tree(ctx.kind);
    for (key, value) in &map {
        if !FIELD_NAME_REGEX.is_match(key) {
            return Err(CompileError::invalid(
                format!("Top-level group fields must match {}", FIELD_NAME_PATTERN),
                key.clone(),
            ));
        }
        let component = tree.add_component(root, key);
        tree.push_child(root, component);
        if key == "_id" {
            parse_id(&mut tree, ctx, component, value)?;
        } else {
            parse_accumulator(&mut tree, ctx, component, value)?;
        }
    }
    Ok(tree)
}

/// The grouping key: null, a property, an object of keys or a variable
fn parse_id(tree: &mut Tree, ctx: &StageContext<'_, '_>, c: ComponentId, value: &Value) -> Result<()> {
    let slot = Slot::Value(c);
    if let Some(name) = ctx.variable(value) {
        slot.place(tree, RValue::Variable(name));
        return Ok(());
    }
    match value {
        Value::Null => {
            slot.place(tree, RValue::Simple(Value::Null));
            Ok(())
        }
        Value::String(_) => parse_simple_or_expression(tree, ctx, slot, value),
        Value::Object(_) => parse_expression(tree, ctx, slot, value).map(|_| ()),
        _ => Err(CompileError::invalid("Invalid group _id. Object expected.", "_id")),
    }
}

/// `field: {$accumulator: argument}`
fn parse_accumulator(tree: &mut Tree, ctx: &StageContext<'_, '_>, c: ComponentId, value: &Value) -> Result<()> {
    let path = tree.component(c).fullpath.clone();
    let single = || CompileError::invalid("Group accumulator expression requires a single supported accumulator property", path.clone());

    let map = value.as_object().ok_or_else(single)?;
    let (key, argument) = match map.iter().next() {
        Some((key, argument)) if map.len() == 1 => (key.clone(), argument),
        _ => return Err(single()),
    };
    let accumulator = Accumulator::lookup(&key).ok_or_else(single)?;
    check_expression(tree, c, value, &ctx.limits)?;

    let expression: ValueId = Slot::Value(c).place(tree, RValue::Expression(Vec::new()));
    let op = tree.add_component(expression, &key);
    tree.push_child(expression, op);

    let variable = ctx.variable(argument);
    check_all(
        accumulator.rules(),
        &RuleInput {
            tree,
            component: op,
            operator: &key,
            value: argument,
            variable: variable.is_some(),
            limits: &ctx.limits,
        },
    )?;
    let slot = Slot::Value(op);
    match variable {
        Some(name) => {
            slot.place(tree, RValue::Variable(name));
            Ok(())
        }
        None => parse_simple_or_expression(tree, ctx, slot, argument),
    }
}
