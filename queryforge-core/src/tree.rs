// queryforge-core/src/tree.rs
//! Arena-backed expression tree
//!
//! Every stage parses its JSON into one `Tree`: components (a key plus the
//! value it owns) and values (`RValue`s) live in two flat vectors and refer to
//! each other by index. Paths are computed once when a component is created,
//! so the tree is immutable after parsing and can be walked freely while the
//! stage keeps its own mutable compile state next to it.
//!
//! ```text
//! root component ($match)
//!     └─ Expression
//!          ├─ component c_name ── Simple("a")
//!          └─ component $or ───── Array
//!                                  ├─ Expression ─ component c_age ─ Expression ─ $gt ─ Simple(1)
//!                                  └─ Expression ─ ...
//! ```

use crate::value_utils::normalize_property_path;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

/// The stage component every tree starts from
pub const ROOT: ComponentId = ComponentId(0);

/// Parsed value shapes
#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    /// Object value: one component per key, in input order
    Expression(Vec<ComponentId>),
    Array(Vec<ValueId>),
    /// Opaque literal
    Simple(Value),
    /// Field reference, built as `$path`
    Property(String),
    /// `{{name}}` placeholder
    Variable(String),
    /// Unvalidated passthrough
    Raw(Value),
}

impl RValue {
    pub fn kind(&self) -> &'static str {
        match self {
            RValue::Expression(_) => "Expression",
            RValue::Array(_) => "Array",
            RValue::Simple(_) => "Simple",
            RValue::Property(_) => "Property",
            RValue::Variable(_) => "Variable",
            RValue::Raw(_) => "Raw",
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, RValue::Variable(_))
    }
}

#[derive(Debug, Clone)]
pub struct Component {
    pub key: String,
    pub value: Option<ValueId>,
    /// Expression this component is a key of; None for the stage root
    pub parent: Option<ValueId>,
    /// Keys from the stage down to this component, operators included
    pub fullpath: String,
    /// `fullpath` without operators and positions
    pub property_fullpath: String,
}

impl Component {
    pub fn is_operator(&self) -> bool {
        self.key.starts_with('$')
    }

    pub fn property_name(&self) -> &str {
        crate::value_utils::last_segment(&self.property_fullpath)
    }
}

#[derive(Debug, Clone)]
pub struct ValueNode {
    pub rvalue: RValue,
    /// Component owning this value, directly or through an array
    pub component: ComponentId,
    /// Array this value is an element of
    pub array: Option<ValueId>,
    /// Position inside `array`, 0 otherwise
    pub position: usize,
    /// Expression nesting depth, the root expression being 0
    pub depth: usize,
}

/// Traversal item handed to `Tree::walk`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Component(ComponentId),
    Value(ValueId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Do not descend below the current item
    Skip,
    /// Abort the whole walk
    Stop,
}

#[derive(Debug, Clone)]
pub struct Tree {
    components: Vec<Component>,
    values: Vec<ValueNode>,
}

impl Tree {
    pub fn new(stage_key: &str) -> Self {
        Tree {
            components: vec![Component {
                key: stage_key.to_string(),
                value: None,
                parent: None,
                fullpath: String::new(),
                property_fullpath: String::new(),
            }],
            values: Vec::new(),
        }
    }

    pub fn root(&self) -> ComponentId {
        ROOT
    }

    pub fn component(&self, id: ComponentId) -> &Component {
        &self.components[id.0]
    }

    pub fn value(&self, id: ValueId) -> &ValueNode {
        &self.values[id.0]
    }

    pub fn rvalue(&self, id: ValueId) -> &RValue {
        &self.values[id.0].rvalue
    }

    pub fn component_rvalue(&self, id: ComponentId) -> Option<&RValue> {
        self.component(id).value.map(|v| self.rvalue(v))
    }

    pub fn key(&self, id: ComponentId) -> &str {
        &self.component(id).key
    }

    pub fn is_root(&self, id: ComponentId) -> bool {
        id == ROOT
    }

    pub fn is_operator(&self, id: ComponentId) -> bool {
        self.component(id).is_operator()
    }

    pub fn parent_component(&self, id: ComponentId) -> Option<ComponentId> {
        self.component(id).parent.map(|v| self.value(v).component)
    }

    /// Directly below the stage
    pub fn is_top_level(&self, id: ComponentId) -> bool {
        self.parent_component(id) == Some(ROOT)
    }

    /// Components of an expression value
    pub fn children(&self, value: ValueId) -> &[ComponentId] {
        match self.rvalue(value) {
            RValue::Expression(children) => children,
            _ => &[],
        }
    }

    /// Elements of an array value
    pub fn elements(&self, value: ValueId) -> &[ValueId] {
        match self.rvalue(value) {
            RValue::Array(elements) => elements,
            _ => &[],
        }
    }

    /// Depth a new expression owned by `owner` would have
    pub fn depth_for(&self, owner: ComponentId) -> usize {
        match self.component(owner).parent {
            None => 0,
            Some(parent) => self.value(parent).depth + 1,
        }
    }

    /// Add a component as a key of `parent` (not yet linked into it)
    pub fn add_component(&mut self, parent: ValueId, key: &str) -> ComponentId {
        let owner = self.value(parent).component;
        let fullpath = if self.is_root(owner) {
            key.to_string()
        } else {
            format!("{}.{}", self.component(owner).fullpath, key)
        };
        let property_fullpath = normalize_property_path(&fullpath);
        let id = ComponentId(self.components.len());
        self.components.push(Component {
            key: key.to_string(),
            value: None,
            parent: Some(parent),
            fullpath,
            property_fullpath,
        });
        id
    }

    pub fn add_value(&mut self, owner: ComponentId, rvalue: RValue) -> ValueId {
        let depth = self.depth_for(owner);
        let id = ValueId(self.values.len());
        self.values.push(ValueNode {
            rvalue,
            component: owner,
            array: None,
            position: 0,
            depth,
        });
        id
    }

    /// Add an element value of `array` (not yet linked into it)
    pub fn add_element(&mut self, array: ValueId, position: usize, rvalue: RValue) -> ValueId {
        let owner = self.value(array).component;
        let id = self.add_value(owner, rvalue);
        let node = &mut self.values[id.0];
        node.array = Some(array);
        node.position = position;
        id
    }

    pub fn set_component_value(&mut self, component: ComponentId, value: ValueId) {
        self.components[component.0].value = Some(value);
    }

    pub fn push_child(&mut self, expression: ValueId, child: ComponentId) {
        if let RValue::Expression(children) = &mut self.values[expression.0].rvalue {
            children.push(child);
        }
    }

    pub fn push_element(&mut self, array: ValueId, element: ValueId) {
        if let RValue::Array(elements) = &mut self.values[array.0].rvalue {
            elements.push(element);
        }
    }

    /// Reconstruct the JSON a value was parsed from
    pub fn underlying(&self, value: ValueId) -> Value {
        match self.rvalue(value) {
            RValue::Expression(children) => {
                let mut map = Map::new();
                for child in children {
                    if let Some(v) = self.component(*child).value {
                        map.insert(self.key(*child).to_string(), self.underlying(v));
                    }
                }
                Value::Object(map)
            }
            RValue::Array(elements) => {
                Value::Array(elements.iter().map(|e| self.underlying(*e)).collect())
            }
            RValue::Simple(v) | RValue::Raw(v) => v.clone(),
            RValue::Property(path) => Value::String(path.clone()),
            RValue::Variable(name) => Value::String(format!("{{{{{}}}}}", name)),
        }
    }

    /// Depth-first walk over components and/or values below `start`
    pub fn walk<F>(&self, start: ComponentId, components: bool, values: bool, f: &mut F) -> WalkControl
    where
        F: FnMut(Visit) -> WalkControl,
    {
        let mut control = WalkControl::Continue;
        if components {
            control = f(Visit::Component(start));
            if control == WalkControl::Stop {
                return control;
            }
        }
        if control != WalkControl::Skip {
            if let Some(value) = self.component(start).value {
                if self.walk_value(value, components, values, f) == WalkControl::Stop {
                    return WalkControl::Stop;
                }
            }
        }
        WalkControl::Continue
    }

    fn walk_value<F>(&self, value: ValueId, components: bool, values: bool, f: &mut F) -> WalkControl
    where
        F: FnMut(Visit) -> WalkControl,
    {
        let mut control = WalkControl::Continue;
        if values {
            control = f(Visit::Value(value));
            if control == WalkControl::Stop {
                return control;
            }
        }
        if control != WalkControl::Skip {
            match self.rvalue(value) {
                RValue::Expression(children) => {
                    for child in children {
                        if self.walk(*child, components, values, f) == WalkControl::Stop {
                            return WalkControl::Stop;
                        }
                    }
                }
                RValue::Array(elements) => {
                    for element in elements {
                        if self.walk_value(*element, components, values, f) == WalkControl::Stop {
                            return WalkControl::Stop;
                        }
                    }
                }
                _ => {}
            }
        }
        WalkControl::Continue
    }

    /// Sorted, distinct variable names used anywhere in the tree
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(ROOT, false, true, &mut |visit| {
            if let Visit::Value(v) = visit {
                if let RValue::Variable(name) = self.rvalue(v) {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
            WalkControl::Continue
        });
        names.sort();
        names
    }

    /// Distinct property paths used below the stage, shortest first
    pub fn property_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        self.walk(ROOT, true, false, &mut |visit| {
            if let Visit::Component(c) = visit {
                let path = &self.component(c).property_fullpath;
                if !path.is_empty() && !paths.contains(path) {
                    paths.push(path.clone());
                }
            }
            WalkControl::Continue
        });
        paths.sort_by_key(|p| p.len());
        paths
    }
}

// ============================================================================
// BUILD RESULTS
// ============================================================================

/// Result of building a component.
///
/// `Replace` discards the structural merge of the enclosing expression and
/// substitutes its content for the whole result.
#[derive(Debug, Clone, PartialEq)]
pub enum Built {
    Value(Value),
    Replace(Box<Built>),
}

impl Built {
    pub fn replace(value: Value) -> Self {
        Built::Replace(Box::new(Built::Value(value)))
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self, Built::Replace(_))
    }

    /// Strip every replacement layer
    pub fn into_value(self) -> Value {
        let mut current = self;
        loop {
            match current {
                Built::Value(v) => return v,
                Built::Replace(inner) => current = *inner,
            }
        }
    }
}

/// Merge a built object into an expression under construction.
///
/// Keys are inserted when absent; when any key already exists, the whole
/// object is appended to `$and` instead so neither condition is lost.
pub fn merge_built(into: &mut Map<String, Value>, object: Map<String, Value>) {
    if object.keys().any(|key| into.contains_key(key)) {
        let and = into
            .entry("$and".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = and {
            items.push(Value::Object(object));
        }
    } else {
        into.extend(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> (Tree, ComponentId, ComponentId) {
        let mut tree = Tree::new("$match");
        let root_value = tree.add_value(ROOT, RValue::Expression(Vec::new()));
        tree.set_component_value(ROOT, root_value);

        let field = tree.add_component(root_value, "c_age");
        tree.push_child(root_value, field);
        let expression = tree.add_value(field, RValue::Expression(Vec::new()));
        tree.set_component_value(field, expression);

        let op = tree.add_component(expression, "$in");
        tree.push_child(expression, op);
        let array = tree.add_value(op, RValue::Array(Vec::new()));
        tree.set_component_value(op, array);
        for (i, v) in [json!(1), json!(2)].into_iter().enumerate() {
            let element = tree.add_element(array, i, RValue::Simple(v));
            tree.push_element(array, element);
        }
        let var = tree.add_element(array, 2, RValue::Variable("limit".into()));
        tree.push_element(array, var);
        (tree, field, op)
    }

    #[test]
    fn test_paths_and_parents() {
        let (tree, field, op) = sample();
        assert_eq!(tree.component(op).fullpath, "c_age.$in");
        assert_eq!(tree.component(op).property_fullpath, "c_age");
        assert_eq!(tree.parent_component(op), Some(field));
        assert!(tree.is_top_level(field));
        assert!(!tree.is_top_level(op));
        assert!(tree.is_operator(op));
    }

    #[test]
    fn test_depth_and_positions() {
        let (tree, field, op) = sample();
        let expression = tree.component(field).value.unwrap();
        assert_eq!(tree.value(expression).depth, 1);
        let array = tree.component(op).value.unwrap();
        let second = tree.elements(array)[1];
        assert_eq!(tree.value(second).position, 1);
        assert_eq!(tree.value(second).array, Some(array));
    }

    #[test]
    fn test_underlying_and_variables() {
        let (tree, field, _) = sample();
        let value = tree.component(field).value.unwrap();
        assert_eq!(tree.underlying(value), json!({"$in": [1, 2, "{{limit}}"]}));
        assert_eq!(tree.variables(), vec!["limit".to_string()]);
        assert_eq!(tree.property_paths(), vec!["c_age".to_string()]);
    }

    #[test]
    fn test_walk_can_stop_early() {
        let (tree, _, _) = sample();
        let mut seen = 0;
        let control = tree.walk(ROOT, true, true, &mut |_| {
            seen += 1;
            if seen == 3 {
                WalkControl::Stop
            } else {
                WalkControl::Continue
            }
        });
        assert_eq!(control, WalkControl::Stop);
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_built_unwraps_nested_replacements() {
        let built = Built::Replace(Box::new(Built::replace(json!({"a": 1}))));
        assert!(built.is_replacement());
        assert_eq!(built.into_value(), json!({"a": 1}));
    }

    #[test]
    fn test_merge_built_pushes_conflicts_to_and() {
        let mut into = json!({"c_a": 1}).as_object().unwrap().clone();
        merge_built(&mut into, json!({"c_b": 2}).as_object().unwrap().clone());
        merge_built(&mut into, json!({"c_a": 3}).as_object().unwrap().clone());
        assert_eq!(Value::Object(into), json!({"c_a": 1, "c_b": 2, "$and": [{"c_a": 3}]}));
    }
}
