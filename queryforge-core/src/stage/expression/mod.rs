// queryforge-core/src/stage/expression/mod.rs
//! Pipeline expressions shared by `$project`, `$addFields` and `$group`
//!
//! An expression object holds either output fields or exactly one operator.
//! Parsing produces the usual `Tree`; `generate` then infers one projected
//! node per output field (type, array-ness and the schema nodes it reads),
//! and `build` renders the native expression.

pub(crate) mod build;
mod generate;
pub mod operators;

pub use operators::{Accumulator, AccumulatorOutput, PipelineOp, Template};

use super::{check_expression, Expansion, Slot, StageContext, StageKind};
use crate::error::{CompileError, Result};
use crate::limits::{FIELD_NAME_PATTERN, FIELD_NAME_REGEX};
use crate::rules::{check_all, RuleInput};
use crate::schema::{date_value, object_id_hex, parse_date};
use crate::tree::{ComponentId, RValue, Tree, ValueId};
use crate::value_utils::{as_integer, is_inclusion, is_valid_property_path};
use ahash::{AHashMap, AHashSet};
use serde_json::{json, Map, Value};
use std::cell::RefCell;

/// A parsed pipeline expression tree plus the state generation collects
pub struct PipelineExpression<'a, 'c, 's> {
    ctx: &'a StageContext<'c, 's>,
    tree: Tree,
    /// Property values to render through the locale side table, by locale
    localized: RefCell<AHashMap<ValueId, String>>,
    /// `$count` accumulators over array sources
    counted_arrays: RefCell<AHashSet<ComponentId>>,
    expansions: RefCell<Vec<Expansion>>,
}

impl<'a, 'c, 's> PipelineExpression<'a, 'c, 's> {
    pub fn new(ctx: &'a StageContext<'c, 's>, tree: Tree) -> Self {
        PipelineExpression {
            ctx,
            tree,
            localized: RefCell::new(AHashMap::new()),
            counted_arrays: RefCell::new(AHashSet::new()),
            expansions: RefCell::new(Vec::new()),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn expansions(&self) -> Vec<Expansion> {
        self.expansions.borrow().clone()
    }

    fn kind(&self) -> StageKind {
        self.ctx.kind
    }

    fn fullpath(&self, c: ComponentId) -> String {
        self.tree.component(c).fullpath.clone()
    }

    fn value_id(&self, c: ComponentId) -> Result<ValueId> {
        self.tree
            .component(c)
            .value
            .ok_or_else(|| CompileError::invalid("Unknown expression value type.", self.fullpath(c)))
    }

    /// Accumulator operators only exist directly below a top-level `$group` field
    fn accumulator(&self, c: ComponentId) -> Option<Accumulator> {
        if self.kind() != StageKind::Group || !self.tree.is_operator(c) {
            return None;
        }
        let parent = self.tree.parent_component(c)?;
        if self.tree.is_top_level(parent) && self.tree.key(parent) != "_id" {
            Accumulator::lookup(self.tree.key(c))
        } else {
            None
        }
    }

    fn pipeline_op(&self, c: ComponentId) -> Result<PipelineOp> {
        let key = self.tree.key(c);
        PipelineOp::lookup(key)
            .ok_or_else(|| CompileError::invalid(format!("Invalid operator {}", key), self.fullpath(c)))
    }

    /// The value sits directly inside an operator (or an operator's array)
    fn in_operator(&self, v: ValueId) -> bool {
        self.tree.is_operator(self.tree.value(v).component)
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Structural checks on one expression object: fields or a single operator
pub(crate) fn check_fields_or_operator(
    kind: StageKind,
    map: &Map<String, Value>,
    top_level: bool,
    path: &str,
) -> Result<()> {
    let operators = map.keys().filter(|k| k.starts_with('$')).count();
    let fields = map
        .iter()
        .filter(|(k, v)| !k.starts_with('$') && (!top_level || *k != "_id" || is_truthy(v)))
        .count();
    if operators + fields == 0 {
        return Err(CompileError::invalid(
            format!("{} stage requires at least one output field", kind.key()),
            path,
        ));
    }
    if operators > 1 || (operators == 1 && fields > 0) {
        return Err(CompileError::invalid(
            "operator expressions cannot mix field names with operators",
            path,
        ));
    }
    Ok(())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn is_falsy_field(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(false)) || as_integer(value) == Some(0)
}

pub(crate) fn check_field_name(key: &str, path: &str) -> Result<()> {
    if FIELD_NAME_REGEX.is_match(key) {
        Ok(())
    } else {
        Err(CompileError::invalid(
            format!("pipeline expression field names must match {}", FIELD_NAME_PATTERN),
            path,
        ))
    }
}

/// Parse a `{...}` value into `slot`
pub(crate) fn parse_expression(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    slot: Slot,
    value: &Value,
) -> Result<ValueId> {
    let owner = slot.owner(tree);
    let map = check_expression(tree, owner, value, &ctx.limits)?;
    check_fields_or_operator(ctx.kind, map, false, &tree.component(owner).fullpath)?;
    let expression = slot.place(tree, RValue::Expression(Vec::new()));
    fill_expression(tree, ctx, expression, map)?;
    Ok(expression)
}

pub(crate) fn fill_expression(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    expression: ValueId,
    map: &Map<String, Value>,
) -> Result<()> {
    for (key, value) in map {
        if !key.starts_with('$') && is_falsy_field(value) && ctx.kind != StageKind::Group {
            continue;
        }
        let component = tree.add_component(expression, key);
        tree.push_child(expression, component);
        if key.starts_with('$') {
            parse_operator(tree, ctx, component, value)?;
        } else {
            parse_field(tree, ctx, component, value)?;
        }
    }
    Ok(())
}

fn field_value_error(path: &str) -> CompileError {
    CompileError::invalid(
        "pipeline field values must be inclusions (1 or true), property projections (c_field), or expressions ({$sum: \"c_value\"}).",
        path,
    )
}

/// An output field: inclusion, property projection or nested expression
pub(crate) fn parse_field(tree: &mut Tree, ctx: &StageContext<'_, '_>, c: ComponentId, value: &Value) -> Result<()> {
    let key = tree.key(c).to_string();
    let path = tree.component(c).fullpath.clone();
    check_field_name(&key, &path)?;
    let slot = Slot::Value(c);
    if let Some(name) = ctx.variable(value) {
        slot.place(tree, RValue::Variable(name));
        return Ok(());
    }
    match value {
        Value::Object(_) => {
            parse_expression(tree, ctx, slot, value)?;
        }
        Value::Array(_) => return Err(CompileError::unsupported("array values are unsupported here.", path)),
        Value::String(s) => {
            if s.starts_with("$$") {
                return Err(CompileError::unsupported("pipeline aggregation variables are unsupported.", path));
            }
            if !is_valid_property_path(s) {
                return Err(field_value_error(&path));
            }
            slot.place(tree, RValue::Property(s.clone()));
        }
        Value::Null if ctx.kind == StageKind::Group => {
            slot.place(tree, RValue::Simple(Value::Null));
        }
        other => {
            if ctx.kind == StageKind::Group {
                return Err(CompileError::invalid(
                    "property inclusions and literal values are not allowed here. try wrapping your value in a $literal.",
                    path,
                ));
            }
            if !is_inclusion(other) {
                return Err(field_value_error(&path));
            }
            slot.place(tree, RValue::Simple(other.clone()));
        }
    }
    Ok(())
}

/// A pipeline operator and its arguments
pub(crate) fn parse_operator(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    c: ComponentId,
    value: &Value,
) -> Result<()> {
    let key = tree.key(c).to_string();
    let path = tree.component(c).fullpath.clone();
    let op = PipelineOp::lookup(&key)
        .ok_or_else(|| CompileError::invalid(format!("Invalid operator {}", key), path.clone()))?;
    if op == PipelineOp::Expand && !matches!(ctx.kind, StageKind::Project | StageKind::AddFields) {
        return Err(CompileError::invalid(format!("Invalid operator {}", key), path));
    }

    let wrapped;
    let value = if op.wraps_single_value() && !value.is_array() && ctx.variable(value).is_none() {
        wrapped = Value::Array(vec![value.clone()]);
        &wrapped
    } else {
        value
    };

    let variable = ctx.variable(value);
    check_all(
        op.rules(),
        &RuleInput {
            tree,
            component: c,
            operator: &key,
            value,
            variable: variable.is_some(),
            limits: &ctx.limits,
        },
    )?;
    let slot = Slot::Value(c);
    if let Some(name) = variable {
        slot.place(tree, RValue::Variable(name));
        return Ok(());
    }

    match op.template() {
        Template::SimpleOrExpression => parse_simple_or_expression(tree, ctx, slot, value),
        Template::DateOrSimpleOrExpression => parse_date_or_simple_or_expression(tree, ctx, slot, value),
        Template::AnyExpression => parse_any_expression(tree, ctx, slot, value),
        Template::ArrayOfExpressions => parse_array_of_expressions(tree, ctx, slot, value, &path),
        Template::Literal => {
            let literal = parse_literal(op, value, &path)?;
            slot.place(tree, RValue::Simple(literal));
            Ok(())
        }
        Template::DateToString => parse_date_to_string(tree, ctx, slot, value, &path),
        Template::Expand => parse_expand(tree, slot, value, &path),
    }
}

fn string_argument(s: &str, path: &str) -> Result<RValue> {
    if s.starts_with("$$") {
        return Err(CompileError::unsupported("pipeline aggregation variables are unsupported.", path));
    }
    if s.starts_with('$') {
        // a leading $ would be read natively as a field reference
        return Ok(RValue::Simple(json!({ "$literal": s })));
    }
    if is_valid_property_path(s) {
        Ok(RValue::Property(s.to_string()))
    } else {
        Ok(RValue::Simple(Value::String(s.to_string())))
    }
}

/// Property, literal, variable or nested expression
pub(crate) fn parse_simple_or_expression(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    slot: Slot,
    value: &Value,
) -> Result<()> {
    let path = tree.component(slot.owner(tree)).fullpath.clone();
    if let Some(name) = ctx.variable(value) {
        slot.place(tree, RValue::Variable(name));
        return Ok(());
    }
    match value {
        Value::Object(_) => {
            parse_expression(tree, ctx, slot, value)?;
        }
        Value::Array(_) => return Err(CompileError::unsupported("array values are unsupported here.", path)),
        Value::String(s) => {
            let rvalue = string_argument(s, &path)?;
            slot.place(tree, rvalue);
        }
        other => {
            slot.place(tree, RValue::Simple(other.clone()));
        }
    }
    Ok(())
}

fn parse_date_or_simple_or_expression(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    slot: Slot,
    value: &Value,
) -> Result<()> {
    if value.is_string() {
        if let Some(date) = parse_date(value) {
            slot.place(tree, RValue::Simple(date_value(&date)));
            return Ok(());
        }
    }
    parse_simple_or_expression(tree, ctx, slot, value)
}

/// Anything, arrays included
fn parse_any_expression(tree: &mut Tree, ctx: &StageContext<'_, '_>, slot: Slot, value: &Value) -> Result<()> {
    if let Value::Array(items) = value {
        if ctx.variable(value).is_none() {
            let array = slot.place(tree, RValue::Array(Vec::new()));
            for (position, item) in items.iter().enumerate() {
                parse_any_expression(tree, ctx, Slot::Element(array, position), item)?;
            }
            return Ok(());
        }
    }
    parse_simple_or_expression(tree, ctx, slot, value)
}

fn parse_array_of_expressions(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    slot: Slot,
    value: &Value,
    path: &str,
) -> Result<()> {
    let items = value
        .as_array()
        .ok_or_else(|| CompileError::invalid(format!("{} requires an array.", tree.key(slot.owner(tree))), path))?;
    let array = slot.place(tree, RValue::Array(Vec::new()));
    for (position, item) in items.iter().enumerate() {
        parse_any_expression(tree, ctx, Slot::Element(array, position), item)?;
    }
    Ok(())
}

/// Typed literals, converted up front
fn parse_literal(op: PipelineOp, value: &Value, path: &str) -> Result<Value> {
    let fail = |what: &str| CompileError::invalid(format!("{} expects {} value.", op.key(), what), path);
    match op {
        PipelineOp::String => value.as_str().map(|s| json!(s)).ok_or_else(|| fail("a string")),
        PipelineOp::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| json!(f))
                .ok_or_else(|| fail("a numeric")),
            _ => Err(fail("a numeric")),
        },
        PipelineOp::Integer => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                }
                _ => None,
            };
            parsed.map(|n| json!(n)).ok_or_else(|| fail("an integer"))
        }
        PipelineOp::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s == "true" || s == "false" => Ok(json!(s == "true")),
            _ => Err(fail("a boolean")),
        },
        PipelineOp::Date => parse_date(value).map(|d| date_value(&d)).ok_or_else(|| fail("a date")),
        PipelineOp::ObjectId => object_id_hex(value)
            .map(|hex| json!({ "$oid": hex }))
            .ok_or_else(|| fail("an ObjectId")),
        PipelineOp::Array if value.is_array() => Ok(value.clone()),
        PipelineOp::Array => Err(fail("an array")),
        PipelineOp::Object if value.is_object() => Ok(value.clone()),
        PipelineOp::Object => Err(fail("an object")),
        _ => Ok(value.clone()),
    }
}

/// `[format, date, timezone?]`
fn parse_date_to_string(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    slot: Slot,
    value: &Value,
    path: &str,
) -> Result<()> {
    let items = value.as_array().map(Vec::as_slice).unwrap_or(&[]);
    let array = slot.place(tree, RValue::Array(Vec::new()));
    for (position, item) in items.iter().enumerate() {
        let element = Slot::Element(array, position);
        match position {
            1 => parse_date_or_simple_or_expression(tree, ctx, element, item)?,
            _ => match (ctx.variable(item), item) {
                (Some(name), _) => {
                    element.place(tree, RValue::Variable(name));
                }
                (None, Value::String(s)) => {
                    element.place(tree, RValue::Simple(Value::String(s.clone())));
                }
                _ => {
                    let what = if position == 0 { "format" } else { "timezone" };
                    return Err(CompileError::invalid(
                        format!("$dateToString {} must be a string.", what),
                        path,
                    ));
                }
            },
        }
    }
    Ok(())
}

fn parse_expand(tree: &mut Tree, slot: Slot, value: &Value, path: &str) -> Result<()> {
    let rvalue = match value {
        Value::Array(items) => {
            if items.iter().any(|item| !item.as_str().map_or(false, is_valid_property_path)) {
                return Err(CompileError::unsupported(
                    "$expand as an array expects an array or string properties",
                    path,
                ));
            }
            RValue::Simple(value.clone())
        }
        Value::Object(_) => RValue::Raw(value.clone()),
        other if is_inclusion(other) => RValue::Simple(other.clone()),
        _ => {
            return Err(CompileError::unsupported(
                "$expand expects 1/true, and array of paths, or a projection object.",
                path,
            ))
        }
    };
    slot.place(tree, rvalue);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stage::new_rooted_tree;
    use crate::stage::testing::{context, fixture};
    use crate::options::CompilerOptions;
    use crate::schema::Catalog;
    use crate::tree::ROOT;

    fn parsed(kind: StageKind, value: Value) -> Result<Tree> {
        let schema = fixture();
        let catalog = Catalog::new(&schema);
        let options = CompilerOptions::new("c_pet").with_variables(true);
        let ctx = context(&catalog, &options, kind, false);
        let (mut tree, root) = new_rooted_tree(kind);
        let map = check_expression(&tree, ROOT, &value, &ctx.limits)?.clone();
        check_fields_or_operator(kind, &map, true, "")?;
        fill_expression(&mut tree, &ctx, root, &map)?;
        Ok(tree)
    }

    fn failed(value: Value) -> CompileError {
        parsed(StageKind::Project, value).unwrap_err()
    }

    // ========== Structure ==========

    #[test]
    fn test_fields_and_operators_do_not_mix() {
        let err = failed(json!({"c_x": {"$add": ["c_age", 1], "c_y": 1}}));
        assert_eq!(err.reason(), "operator expressions cannot mix field names with operators");
        let err = failed(json!({"c_x": {"$add": ["c_age", 1], "$multiply": ["c_age", 2]}}));
        assert_eq!(err.reason(), "operator expressions cannot mix field names with operators");
    }

    #[test]
    fn test_field_name_pattern() {
        let err = failed(json!({"c_doc": {"bad name": 1}}));
        assert_eq!(err.reason(), "pipeline expression field names must match ^[a-zA-Z0-9-_]{1,40}$");
    }

    #[test]
    fn test_field_values() {
        assert_eq!(
            failed(json!({"c_x": 5})).reason(),
            "pipeline field values must be inclusions (1 or true), property projections (c_field), or expressions ({$sum: \"c_value\"})."
        );
        assert_eq!(failed(json!({"c_x": [1]})).reason(), "array values are unsupported here.");
        assert_eq!(failed(json!({"c_x": "$$ROOT"})).reason(), "pipeline aggregation variables are unsupported.");

        let tree = parsed(StageKind::Project, json!({"c_name": 1, "c_age": 0, "c_alias": "c_name"})).unwrap();
        let root = tree.component(ROOT).value.unwrap();
        let keys: Vec<&str> = tree.children(root).iter().map(|c| tree.key(*c)).collect();
        assert_eq!(keys, vec!["c_name", "c_alias"]);
        let alias = tree.children(root)[1];
        assert_eq!(tree.component_rvalue(alias), Some(&RValue::Property("c_name".into())));
    }

    // ========== Operators ==========

    #[test]
    fn test_unknown_operator() {
        assert_eq!(failed(json!({"c_x": {"$map": {}}})).reason(), "Invalid operator $map");
        let err = parsed(StageKind::Group, json!({"_id": {"$expand": 1}})).unwrap_err();
        assert_eq!(err.reason(), "Invalid operator $expand");
    }

    #[test]
    fn test_operator_arity() {
        assert_eq!(
            failed(json!({"c_x": {"$subtract": ["c_age"]}})).reason(),
            "$subtract requires an array with exactly 2 elements."
        );
        assert_eq!(
            failed(json!({"c_x": {"$add": ["c_age"]}})).reason(),
            "$add requires an array with at least 2 elements."
        );
        assert!(parsed(StageKind::Project, json!({"c_x": {"$not": "c_flag"}})).is_ok());
    }

    #[test]
    fn test_string_arguments() {
        let tree = parsed(StageKind::Project, json!({"c_x": {"$concat": ["c_name", "$c_name", "a b"]}})).unwrap();
        let root = tree.component(ROOT).value.unwrap();
        let field = tree.children(root)[0];
        let expression = tree.component(field).value.unwrap();
        let op = tree.children(expression)[0];
        assert_eq!(
            tree.underlying(tree.component(op).value.unwrap()),
            json!(["c_name", {"$literal": "$c_name"}, "a b"])
        );
        let array = tree.component(op).value.unwrap();
        assert_eq!(tree.rvalue(tree.elements(array)[0]), &RValue::Property("c_name".into()));
    }

    #[test]
    fn test_typed_literals() {
        assert_eq!(parse_literal(PipelineOp::Number, &json!("1.5"), "").unwrap(), json!(1.5));
        assert_eq!(parse_literal(PipelineOp::Integer, &json!("42.9"), "").unwrap(), json!(42));
        assert_eq!(parse_literal(PipelineOp::Boolean, &json!("true"), "").unwrap(), json!(true));
        assert_eq!(
            parse_literal(PipelineOp::ObjectId, &json!("5a0c3c9e52ea3d0100a0dbe1"), "").unwrap(),
            json!({"$oid": "5a0c3c9e52ea3d0100a0dbe1"})
        );
        let err = parse_literal(PipelineOp::String, &json!(1), "c_x.$string").unwrap_err();
        assert_eq!(err.reason(), "$string expects a string value.");
        let err = parse_literal(PipelineOp::Date, &json!("nope"), "").unwrap_err();
        assert_eq!(err.reason(), "$date expects a date value.");
    }

    #[test]
    fn test_expand_arguments() {
        assert!(parsed(StageKind::Project, json!({"c_owner": {"$expand": ["c_name"]}})).is_ok());
        assert!(parsed(StageKind::AddFields, json!({"c_owner": {"$expand": {"limit": 5}}})).is_ok());
        assert_eq!(
            failed(json!({"c_owner": {"$expand": [1]}})).reason(),
            "$expand as an array expects an array or string properties"
        );
        assert_eq!(
            failed(json!({"c_owner": {"$expand": "yes"}})).reason(),
            "$expand expects 1/true, and array of paths, or a projection object."
        );
    }

    #[test]
    fn test_group_field_literals_rejected() {
        let err = parsed(StageKind::Group, json!({"_id": {"c_k": 1}})).unwrap_err();
        assert_eq!(
            err.reason(),
            "property inclusions and literal values are not allowed here. try wrapping your value in a $literal."
        );
    }

    #[test]
    fn test_variables_in_arguments() {
        let tree = parsed(StageKind::Project, json!({"c_x": {"$add": ["c_age", "{{bonus}}"]}})).unwrap();
        assert_eq!(tree.variables(), vec!["bonus".to_string()]);
    }
}
