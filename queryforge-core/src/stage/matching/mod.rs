// queryforge-core/src/stage/matching/mod.rs
//! `$match` stage
//!
//! A match compiles in four passes over one `Tree`:
//!
//! ```text
//! parse       → operators checked against their rules, values typed
//!     ↓
//! narrowing   → candidate models (object/type) and properties per component
//!     ↓
//! validate    → acl, concrete data, primitives, native index checks queued
//!     ↓
//! build       → natural query + index entry tree, then the coverage post-check
//! ```
//!
//! The per-component caches and the index entries live on `MatchStage` and
//! die with it.

mod build;
mod index_entries;
mod narrowing;
pub mod operators;

pub use index_entries::{slot_key, CompiledIndex, IndexEntries, PathPart};
pub use operators::{CompareOp, MatchOp};

use super::{
    check_expression, new_rooted_tree, normalize_stage_value, Slot, StageContext, StageKind, StageOutput,
};
use crate::error::{CompileError, Result};
use crate::property::{find_property, CandidateProperty};
use crate::rules::{check_all, validate_regexp, Rule, RuleInput};
use crate::schema::{ModelId, NodeId, TypeName};
use crate::tree::{ComponentId, RValue, Tree, ValueId, ROOT};
use crate::value_utils::{
    as_integer, collect_query_keys, is_integer, is_numeric, is_valid_property_path, normalize_property_path,
};
use ahash::AHashMap;
use operators::{ALLOWED_TYPES, TYPE_ALIASES};
use serde_json::{json, Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;

const EARTH_RADIUS_KM: f64 = 6378.1;

/// Compile one `$match` stage value
pub fn compile(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    let tree = parse(value, ctx)?;
    let stage = MatchStage::new(ctx, tree);

    let models = stage.models(ROOT)?;
    let properties = stage.properties(ROOT)?;
    stage.validate()?;
    let query = stage.build()?;

    let mut index_keys = Vec::new();
    collect_query_keys(&query, &mut index_keys);

    Ok(StageOutput {
        json: json!({ "$match": query }),
        models,
        properties,
        projection: None,
        variables: stage.tree.variables(),
        expansions: Vec::new(),
        index_keys,
    })
}

pub(crate) struct MatchStage<'a, 'c, 's> {
    ctx: &'a StageContext<'c, 's>,
    tree: Tree,
    models: RefCell<AHashMap<ComponentId, Vec<ModelId>>>,
    properties: RefCell<AHashMap<ComponentId, Vec<CandidateProperty>>>,
    /// Components whose nodes are references (built as `key._id`)
    references: RefCell<HashSet<ComponentId>>,
    entries: RefCell<IndexEntries>,
    native_checks: RefCell<Vec<(ComponentId, NodeId)>>,
    /// Cleared whenever the index entries stop mirroring the natural query
    index_complete: Cell<bool>,
}

impl<'a, 'c, 's> MatchStage<'a, 'c, 's> {
    fn new(ctx: &'a StageContext<'c, 's>, tree: Tree) -> Self {
        MatchStage {
            ctx,
            tree,
            models: RefCell::new(AHashMap::new()),
            properties: RefCell::new(AHashMap::new()),
            references: RefCell::new(HashSet::new()),
            entries: RefCell::new(IndexEntries::new(ctx.base_find())),
            native_checks: RefCell::new(Vec::new()),
            index_complete: Cell::new(true),
        }
    }

    // ========================================================================
    // TREE HELPERS
    // ========================================================================

    fn op(&self, c: ComponentId) -> Option<MatchOp> {
        if self.tree.is_operator(c) {
            MatchOp::lookup(self.tree.key(c))
        } else {
            None
        }
    }

    fn fullpath(&self, c: ComponentId) -> String {
        self.tree.component(c).fullpath.clone()
    }

    fn value_id(&self, c: ComponentId) -> Result<ValueId> {
        self.tree
            .component(c)
            .value
            .ok_or_else(|| CompileError::invalid("Unknown match value type.", self.fullpath(c)))
    }

    fn parent(&self, c: ComponentId) -> ComponentId {
        self.tree.parent_component(c).unwrap_or(ROOT)
    }

    /// Closest non-operator component at or above `c`
    fn named_component(&self, c: ComponentId) -> ComponentId {
        let mut current = c;
        while !self.tree.is_root(current) && self.tree.is_operator(current) {
            current = self.parent(current);
        }
        current
    }

    /// The candidate property matching this component's path
    fn property(&self, c: ComponentId) -> Result<Option<CandidateProperty>> {
        let properties = self.properties(c)?;
        Ok(find_property(&properties, &self.tree.component(c).property_fullpath).cloned())
    }

    fn mark_reference(&self, c: ComponentId) {
        let mut references = self.references.borrow_mut();
        references.insert(c);
        let mut current = c;
        while self.tree.is_operator(current) {
            let parent = self.parent(current);
            if self.tree.is_root(parent) {
                break;
            }
            references.insert(parent);
            current = parent;
        }
    }

    fn is_reference(&self, c: ComponentId) -> bool {
        self.references.borrow().contains(&c)
    }

    /// Key a component is emitted under
    fn build_key(&self, c: ComponentId) -> String {
        let key = self.tree.key(c);
        if self.is_reference(c) {
            format!("{}._id", key)
        } else {
            key.to_string()
        }
    }

    /// Key an index entry is recorded under; full paths so that entries
    /// below `$elemMatch` still name a real document path
    fn index_key(&self, named: ComponentId) -> String {
        let path = &self.tree.component(named).property_fullpath;
        if self.is_reference(named) {
            format!("{}._id", path)
        } else {
            path.clone()
        }
    }

    fn mark_incomplete(&self) {
        self.index_complete.set(false);
    }

    // ========================================================================
    // VALIDATION
    // ========================================================================

    fn validate(&self) -> Result<()> {
        let root = self.value_id(ROOT)?;
        for child in self.tree.children(root) {
            self.validate_component(*child)?;
        }
        Ok(())
    }

    fn validate_component(&self, c: ComponentId) -> Result<()> {
        let value = self.value_id(c)?;
        if let Some(op) = self.op(c) {
            if self.tree.rvalue(value).is_variable() {
                return Ok(());
            }
            return self.validate_operator(c, op, value);
        }
        match self.tree.rvalue(value) {
            RValue::Array(_) => Err(exact_matching(&self.tree, c)),
            RValue::Expression(children) => {
                for child in children {
                    self.validate_component(*child)?;
                }
                Ok(())
            }
            _ => self.validate_property(c),
        }
    }

    fn validate_operator(&self, c: ComponentId, op: MatchOp, value: ValueId) -> Result<()> {
        match op {
            MatchOp::In | MatchOp::Nin => {
                if self.tree.elements(value).is_empty() {
                    Ok(())
                } else {
                    self.validate_property(c)
                }
            }
            MatchOp::Regex => {
                self.validate_property(c)?;
                let property = self.property(c)?.unwrap_or_else(|| CandidateProperty::new("", Vec::new()));
                for node in &property.nodes {
                    let node = self.ctx.catalog.node(*node);
                    if node.public_type_name() != "String" {
                        return Err(CompileError::invalid(
                            format!(
                                "$regex can only occur against strings. A matched property is not compatible ({}).",
                                node.fqpp
                            ),
                            self.fullpath(c),
                        ));
                    }
                }
                Ok(())
            }
            MatchOp::All => {
                let mut simple = false;
                for element in self.tree.elements(value) {
                    match self.tree.rvalue(*element) {
                        RValue::Simple(_) => {
                            simple = true;
                            break;
                        }
                        RValue::Expression(children) => {
                            for child in children {
                                self.validate_component(*child)?;
                            }
                        }
                        _ => {}
                    }
                }
                if simple {
                    self.validate_property(c)?;
                }
                Ok(())
            }
            MatchOp::And | MatchOp::Or => {
                for element in self.tree.elements(value) {
                    for child in self.tree.children(*element) {
                        self.validate_component(*child)?;
                    }
                }
                Ok(())
            }
            MatchOp::ElemMatch => {
                for child in self.tree.children(value) {
                    self.validate_component(*child)?;
                }
                Ok(())
            }
            _ => self.validate_property(c),
        }
    }

    /// Every node a matched path resolves to must be readable, concrete and
    /// (when the pipeline is index eligible) indexed or queued for the
    /// native index post-check.
    fn validate_property(&self, c: ComponentId) -> Result<()> {
        let path = self.fullpath(c);
        let property = self
            .property(c)?
            .ok_or_else(|| CompileError::invalid("Cannot match by unreconciled field.", path.clone()))?;
        let catalog = self.ctx.catalog;

        let mut references = 0;
        for id in &property.nodes {
            for ancestor in catalog.lineage(*id) {
                self.ctx.authorize(ancestor, true)?;
                let n = catalog.node(ancestor);
                if n.is_reader_backed() {
                    return Err(CompileError::invalid(
                        format!("Matching cannot occur on properties not backed by concrete data ({})", n.fqpp),
                        path,
                    ));
                }
            }

            let node = catalog.node(*id);
            if node.type_name == TypeName::Reference {
                references += 1;
                self.mark_reference(c);
            }

            if self.ctx.strict()
                && !node.is_primitive()
                && !matches!(node.type_name, TypeName::Reference | TypeName::Geometry | TypeName::Any)
            {
                return Err(CompileError::invalid(
                    format!(
                        "Matches can only occur on primitives. A matched property is not compatible ({}). \
                         Try narrowing the search to an object, type, or set which contains only primitives.",
                        node.public_type_name()
                    ),
                    path,
                ));
            }

            if self.ctx.uses_index && !node.native_index && !node.indexed && !self.ctx.options.unindexed {
                self.native_checks.borrow_mut().push((c, *id));
            }
        }

        if references > 0 && references < property.nodes.len() {
            return Err(CompileError::invalid(
                "Matching cannot occur on a reference when mixed with other types. Consider matching by the \
                 reference _id or creating a common field that holds the referenced _id as an ObjectId.",
                path,
            ));
        }
        Ok(())
    }
}

// ============================================================================
// PARSING
// ============================================================================

fn exact_matching(tree: &Tree, c: ComponentId) -> CompileError {
    CompileError::unsupported(
        "Exact matching on objects and arrays is not supported.",
        tree.component(c).fullpath.clone(),
    )
}

fn parse(value: &Value, ctx: &StageContext<'_, '_>) -> Result<Tree> {
    let object = Value::Object(normalize_stage_value(StageKind::Match, value)?);
    let (mut tree, root) = new_rooted_tree(StageKind::Match);
    let map = check_expression(&tree, ROOT, &object, &ctx.limits)?;
    fill_expression(&mut tree, ctx, root, map)?;
    Ok(tree)
}

fn parse_expression(tree: &mut Tree, ctx: &StageContext<'_, '_>, slot: Slot, value: &Value) -> Result<ValueId> {
    let owner = slot.owner(tree);
    let map = check_expression(tree, owner, value, &ctx.limits)?;
    let expression = slot.place(tree, RValue::Expression(Vec::new()));
    fill_expression(tree, ctx, expression, map)?;
    Ok(expression)
}

fn fill_expression(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    expression: ValueId,
    map: &Map<String, Value>,
) -> Result<()> {
    for (key, value) in map {
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

fn simple_or_variable(ctx: &StageContext<'_, '_>, value: &Value) -> RValue {
    match ctx.variable(value) {
        Some(name) => RValue::Variable(name),
        None => RValue::Simple(value.clone()),
    }
}

fn parse_field(tree: &mut Tree, ctx: &StageContext<'_, '_>, c: ComponentId, value: &Value) -> Result<()> {
    let key = tree.key(c).to_string();
    if normalize_property_path(&key) != key || !is_valid_property_path(&key) {
        return Err(CompileError::invalid(
            format!("Invalid field name: ({})", key),
            tree.component(c).fullpath.clone(),
        ));
    }
    match value {
        Value::Array(_) => Err(exact_matching(tree, c)),
        Value::Object(map) => {
            if map.keys().any(|k| !k.starts_with('$')) {
                return Err(exact_matching(tree, c));
            }
            parse_expression(tree, ctx, Slot::Value(c), value)?;
            Ok(())
        }
        _ => {
            let rvalue = simple_or_variable(ctx, value);
            Slot::Value(c).place(tree, rvalue);
            Ok(())
        }
    }
}

fn parse_operator(tree: &mut Tree, ctx: &StageContext<'_, '_>, c: ComponentId, value: &Value) -> Result<()> {
    let key = tree.key(c).to_string();
    let path = tree.component(c).fullpath.clone();
    let op = MatchOp::lookup(&key)
        .ok_or_else(|| CompileError::invalid(format!("Invalid operator {}", key), path.clone()))?;
    if op.is_restricted() && !ctx.options.is_restricted_op_allowed(&key) {
        return Err(CompileError::access_denied(format!("Invalid operator {}", key), path));
    }

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

    match op {
        MatchOp::Eq | MatchOp::Ne | MatchOp::Gt | MatchOp::Gte | MatchOp::Lt | MatchOp::Lte => {
            slot.place(tree, RValue::Simple(value.clone()));
        }
        MatchOp::Type => {
            if !value.as_str().map_or(false, |t| ALLOWED_TYPES.contains(t)) {
                return Err(CompileError::invalid(
                    format!("Operator {} expects one of {}", key, TYPE_ALIASES),
                    path,
                ));
            }
            slot.place(tree, RValue::Simple(value.clone()));
        }
        MatchOp::Exists => {
            if !value.is_boolean() {
                return Err(CompileError::invalid(format!("Operator {} expects a boolean", key), path));
            }
            slot.place(tree, RValue::Simple(value.clone()));
        }
        MatchOp::In | MatchOp::Nin => parse_value_list(tree, ctx, c, &key, value)?,
        MatchOp::And | MatchOp::Or => {
            let array = slot.place(tree, RValue::Array(Vec::new()));
            for (position, element) in value.as_array().into_iter().flatten().enumerate() {
                let element_slot = Slot::Element(array, position);
                match ctx.variable(element) {
                    Some(name) => {
                        element_slot.place(tree, RValue::Variable(name));
                    }
                    None => {
                        parse_expression(tree, ctx, element_slot, element)?;
                    }
                }
            }
        }
        MatchOp::Regex => {
            let regex = validate_regexp(value, &ctx.limits, &path)?;
            slot.place(tree, RValue::Simple(regex.to_value()));
        }
        MatchOp::Size => {
            if !is_integer(value) || as_integer(value).map_or(true, |n| n < 0) {
                return Err(CompileError::invalid("Operator $size expects an integer value >= 0.", path));
            }
            slot.place(tree, RValue::Simple(value.clone()));
        }
        MatchOp::All => parse_all(tree, ctx, c, value)?,
        MatchOp::ElemMatch => {
            parse_expression(tree, ctx, slot, value)?;
        }
        MatchOp::Within => {
            let shape = parse_within(value, &path)?;
            slot.place(tree, RValue::Simple(shape));
        }
    }
    Ok(())
}

/// `$in`/`$nin` values. `{$regex: "/.../"}` elements become regex literals.
fn parse_value_list(
    tree: &mut Tree,
    ctx: &StageContext<'_, '_>,
    c: ComponentId,
    key: &str,
    value: &Value,
) -> Result<()> {
    let path = tree.component(c).fullpath.clone();
    let array = Slot::Value(c).place(tree, RValue::Array(Vec::new()));
    for (position, element) in value.as_array().into_iter().flatten().enumerate() {
        let rvalue = match element {
            Value::Object(map) if map.len() == 1 && map.contains_key("$regex") => {
                let regex = validate_regexp(&map["$regex"], &ctx.limits, &path)?;
                RValue::Simple(regex.to_value())
            }
            _ => match ctx.variable(element) {
                Some(name) => RValue::Variable(name),
                None => {
                    Rule::ValueMustBeSimpleOrPrimitive.check(&RuleInput {
                        tree,
                        component: c,
                        operator: key,
                        value: element,
                        variable: false,
                        limits: &ctx.limits,
                    })?;
                    RValue::Simple(element.clone())
                }
            },
        };
        Slot::Element(array, position).place(tree, rvalue);
    }
    Ok(())
}

fn parse_all(tree: &mut Tree, ctx: &StageContext<'_, '_>, c: ComponentId, value: &Value) -> Result<()> {
    let path = tree.component(c).fullpath.clone();
    let items = value.as_array().ok_or_else(|| {
        CompileError::invalid("Operator $all expects an array of values for property.", path.clone())
    })?;
    if crate::limits::exceeds(ctx.limits.max_all_elements, items.len()) {
        return Err(CompileError::invalid(
            format!(
                "Operator $all expects an array with a maximum of {} values.",
                crate::limits::MAX_ALL_ELEMENTS
            ),
            path,
        ));
    }

    let array = Slot::Value(c).place(tree, RValue::Array(Vec::new()));
    let mut simple = 0;
    let mut expressions = 0;
    for (position, item) in items.iter().enumerate() {
        let slot = Slot::Element(array, position);
        if let Some(name) = ctx.variable(item) {
            slot.place(tree, RValue::Variable(name));
            continue;
        }
        match item {
            Value::Array(_) => {
                return Err(CompileError::invalid("Operator $all value cannot be an array", path));
            }
            Value::Object(_) => {
                expressions += 1;
                let expression = parse_expression(tree, ctx, slot, item)?;
                let children = tree.children(expression);
                if children.len() != 1 || tree.key(children[0]) != "$elemMatch" {
                    return Err(CompileError::invalid(
                        "Operator $all expects $elemMatch values for property.",
                        path,
                    ));
                }
            }
            _ => {
                simple += 1;
                slot.place(tree, RValue::Simple(item.clone()));
            }
        }
    }
    if simple > 0 && expressions > 0 {
        return Err(CompileError::invalid(
            "Operator $all value must either be all primitives or all $elemMatch objects, but not some of both.",
            path,
        ));
    }
    Ok(())
}

fn is_lng_lat(value: Option<&Value>) -> bool {
    match value.and_then(Value::as_array) {
        Some(pair) if pair.len() == 2 => match (pair[0].as_f64(), pair[1].as_f64()) {
            (Some(lng), Some(lat)) => (-180.0..=180.0).contains(&lng) && (-90.0..=90.0).contains(&lat),
            _ => false,
        },
        _ => false,
    }
}

/// `{$center: [lng, lat], $radius: km}` as a `$centerSphere` in radians
fn parse_within(value: &Value, path: &str) -> Result<Value> {
    let center = value.get("$center");
    if !is_lng_lat(center) {
        return Err(CompileError::invalid(
            "Operator $within.$center must be an array of 2 elements with valid lng and lat values",
            path,
        ));
    }
    let radius = value
        .get("$radius")
        .filter(|r| is_numeric(r))
        .and_then(|r| match r {
            Value::String(s) => s.trim().parse::<f64>().ok(),
            other => other.as_f64(),
        })
        .filter(|r| *r >= 0.0)
        .ok_or_else(|| {
            CompileError::invalid("Operator $within.$radius must be a value in kilometers >= 0", path)
        })?;
    Ok(json!({ "$centerSphere": [center, radius / EARTH_RADIUS_KM] }))
}
