// queryforge-core/src/rules.rs
//! Parse rules
//!
//! Small validators that operator definitions run against the raw JSON value
//! before the value is parsed into the tree. Rules see the component being
//! parsed, so they can inspect its parents as well.

use crate::error::{CompileError, Result};
use crate::limits::{exceeds, Limits};
use crate::regex_cache::QueryRegex;
use crate::tree::{ComponentId, Tree};
use crate::value_utils::is_valid_property_path;
use serde_json::Value;

/// Everything a rule may look at
pub struct RuleInput<'a> {
    pub tree: &'a Tree,
    pub component: ComponentId,
    pub operator: &'a str,
    pub value: &'a Value,
    /// The value is a `{{variable}}` placeholder
    pub variable: bool,
    pub limits: &'a Limits,
}

impl<'a> RuleInput<'a> {
    fn path(&self) -> String {
        self.tree.component(self.component).fullpath.clone()
    }

    fn fail(&self, reason: String) -> CompileError {
        CompileError::invalid(reason, self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    ValueMustBeSimpleOrPrimitiveOrEmpty,
    ValueMustBeSimpleOrPrimitive,
    ValueMustBePropertyPath,
    ValueMustBePropertyPathIfString,
    ValueMustBeObject,
    ParentMustBeProperty,
    ParentMustBePropertyOrAll,
    UpstreamMustBePropertyOrAllOrElemMatch,
    MustBeArray,
    MustBeArrayOfMaxInElements,
    MustBeTopLevelOrInsideLogical,
    MustBeArrayOfConditions,
    ArrayOfSize(usize),
    ArrayOfAtLeastSize(usize),
    ArrayOfLengthBetween(usize, usize),
}

fn is_structured(value: &Value) -> bool {
    value.is_array() || value.is_object()
}

fn is_non_empty_structure(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

fn is_property_path(value: &str) -> bool {
    is_valid_property_path(value)
}

impl Rule {
    pub fn check(&self, input: &RuleInput<'_>) -> Result<()> {
        let op = input.operator;
        let value = input.value;
        let variable = input.variable;

        match self {
            Rule::ValueMustBeSimpleOrPrimitiveOrEmpty => {
                if !variable && is_non_empty_structure(value) {
                    return Err(input.fail(format!(
                        "Operator {} expects a primitive value for property.",
                        op
                    )));
                }
            }
            Rule::ValueMustBeSimpleOrPrimitive => {
                if !variable && is_structured(value) {
                    return Err(input.fail(format!(
                        "Operator {} expects a primitive value for property.",
                        op
                    )));
                }
            }
            Rule::ValueMustBePropertyPath => {
                let valid = value.as_str().map_or(false, is_property_path);
                if !variable && !valid {
                    return Err(input.fail(format!("Operator {} expects a valid property path.", op)));
                }
            }
            Rule::ValueMustBePropertyPathIfString => {
                if let Value::String(s) = value {
                    if !variable && !is_property_path(s) {
                        return Err(input.fail(format!("Operator {} expects a valid property path.", op)));
                    }
                }
            }
            Rule::ValueMustBeObject => {
                if !variable && !value.is_object() {
                    return Err(input.fail(format!("Operator {} expects an object.", op)));
                }
            }
            Rule::ParentMustBeProperty => {
                let parent = input.tree.parent_component(input.component);
                if parent.map_or(true, |c| input.tree.is_operator(c)) {
                    return Err(input.fail(format!(
                        "Operator {} must have a property as a direct parent.",
                        op
                    )));
                }
            }
            Rule::ParentMustBePropertyOrAll => {
                let parent = input.tree.parent_component(input.component);
                let ok = parent.map_or(false, |c| {
                    !input.tree.is_operator(c) || input.tree.key(c) == "$all"
                });
                if !ok {
                    return Err(input.fail(format!(
                        "Operator {} must have a property or $elemMatch as a direct parent.",
                        op
                    )));
                }
            }
            Rule::UpstreamMustBePropertyOrAllOrElemMatch => {
                let mut current = input.tree.parent_component(input.component);
                while let Some(c) = current {
                    if !input.tree.is_operator(c) {
                        return Ok(());
                    }
                    if !matches!(input.tree.key(c), "$all" | "$elemMatch") {
                        break;
                    }
                    current = input.tree.parent_component(c);
                }
                return Err(input.fail(format!(
                    "Operator {} must be applied to a property or within $all or $elemMatch expressions.",
                    op
                )));
            }
            Rule::MustBeArray => {
                if !variable && !value.is_array() {
                    return Err(input.fail(format!("{} requires an array.", op)));
                }
            }
            Rule::MustBeArrayOfMaxInElements => {
                if !variable {
                    let items = value.as_array().ok_or_else(|| {
                        input.fail(format!("Operator {} expects an array of values for property.", op))
                    })?;
                    if exceeds(input.limits.max_in_elements, items.len()) {
                        return Err(input.fail(format!(
                            "Operator {} expects an array with a maximum of {} values.",
                            op,
                            crate::limits::MAX_IN_ELEMENTS
                        )));
                    }
                }
            }
            Rule::MustBeTopLevelOrInsideLogical => {
                if let Some(parent) = input.tree.parent_component(input.component) {
                    let allowed = input.tree.is_root(parent)
                        || (input.tree.is_operator(parent)
                            && matches!(input.tree.key(parent), "$and" | "$or" | "$elemMatch"));
                    if !allowed {
                        return Err(input.fail(format!(
                            "Operator {} can only be nested within $and/$or/$elemMatch.",
                            op
                        )));
                    }
                }
            }
            Rule::MustBeArrayOfConditions => {
                if !variable {
                    let items = value
                        .as_array()
                        .ok_or_else(|| input.fail(format!("Operator {} value must be an array.", op)))?;
                    if items.is_empty() {
                        return Err(input.fail(format!("Operator {} must contain at least 1 element.", op)));
                    }
                    if exceeds(input.limits.max_logical_conditions, items.len()) {
                        return Err(input.fail(format!(
                            "Maximum {} count ({}) exceeded.",
                            op,
                            crate::limits::MAX_LOGICAL_CONDITIONS
                        )));
                    }
                    if items.iter().any(|item| !item.is_object()) {
                        return Err(input.fail(format!("Operator {} elements must be objects.", op)));
                    }
                }
            }
            Rule::ArrayOfSize(size) => {
                let ok = value.as_array().map_or(false, |items| items.len() == *size);
                if !variable && !ok {
                    return Err(input.fail(format!(
                        "{} requires an array with exactly {} elements.",
                        op, size
                    )));
                }
            }
            Rule::ArrayOfAtLeastSize(size) => {
                let ok = value.as_array().map_or(false, |items| items.len() >= *size);
                if !variable && !ok {
                    return Err(input.fail(format!(
                        "{} requires an array with at least {} elements.",
                        op, size
                    )));
                }
            }
            Rule::ArrayOfLengthBetween(min, max) => {
                let ok = value
                    .as_array()
                    .map_or(false, |items| items.len() >= *min && items.len() <= *max);
                if !variable && !ok {
                    return Err(input.fail(format!(
                        "{} requires an array with {} to {} elements.",
                        op, min, max
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Run rules in order, stopping at the first violation
pub fn check_all(rules: &[Rule], input: &RuleInput<'_>) -> Result<()> {
    rules.iter().try_for_each(|rule| rule.check(input))
}

/// Validate a `/pattern/flags` literal. The in-tree `{"$regex", "$options"}`
/// form is accepted as already validated.
pub fn validate_regexp(value: &Value, limits: &Limits, path: &str) -> Result<QueryRegex> {
    if let Some(regex) = QueryRegex::from_value(value) {
        return Ok(regex);
    }
    let pattern = match value {
        Value::String(s) if !s.is_empty() && !exceeds(limits.max_regexp_length, s.chars().count()) => s,
        other => {
            let shown = match other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            return Err(CompileError::invalid(
                format!(
                    "Pattern ({}) for $regex must be a string between 1 and {} characters.",
                    shown,
                    crate::limits::MAX_REGEXP_LENGTH
                ),
                path,
            ));
        }
    };
    QueryRegex::parse(pattern).ok_or_else(|| {
        CompileError::invalid(format!("Invalid operator $regex pattern: {}", pattern), path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{RValue, ROOT};
    use serde_json::json;

    /// `$match: {c_arr: {<op>: ...}}` with the operator component returned
    fn nested(op: &str) -> (Tree, ComponentId) {
        let mut tree = Tree::new("$match");
        let root_value = tree.add_value(ROOT, RValue::Expression(Vec::new()));
        tree.set_component_value(ROOT, root_value);
        let field = tree.add_component(root_value, "c_arr");
        tree.push_child(root_value, field);
        let expression = tree.add_value(field, RValue::Expression(Vec::new()));
        tree.set_component_value(field, expression);
        let component = tree.add_component(expression, op);
        tree.push_child(expression, component);
        (tree, component)
    }

    fn top_level(op: &str) -> (Tree, ComponentId) {
        let mut tree = Tree::new("$match");
        let root_value = tree.add_value(ROOT, RValue::Expression(Vec::new()));
        tree.set_component_value(ROOT, root_value);
        let component = tree.add_component(root_value, op);
        tree.push_child(root_value, component);
        (tree, component)
    }

    fn run(rule: Rule, tree: &Tree, component: ComponentId, op: &str, value: Value) -> Result<()> {
        let limits = Limits::default();
        rule.check(&RuleInput {
            tree,
            component,
            operator: op,
            value: &value,
            variable: false,
            limits: &limits,
        })
    }

    #[test]
    fn test_primitive_rules() {
        let (tree, c) = nested("$eq");
        assert!(run(Rule::ValueMustBeSimpleOrPrimitive, &tree, c, "$eq", json!(1)).is_ok());
        let err = run(Rule::ValueMustBeSimpleOrPrimitive, &tree, c, "$eq", json!([])).unwrap_err();
        assert_eq!(err.reason(), "Operator $eq expects a primitive value for property.");
        assert!(run(Rule::ValueMustBeSimpleOrPrimitiveOrEmpty, &tree, c, "$eq", json!({})).is_ok());
    }

    #[test]
    fn test_parent_rules() {
        let (tree, c) = nested("$gt");
        assert!(run(Rule::ParentMustBeProperty, &tree, c, "$gt", json!(1)).is_ok());
        let (tree, c) = top_level("$gt");
        let err = run(Rule::ParentMustBeProperty, &tree, c, "$gt", json!(1)).unwrap_err();
        assert_eq!(err.reason(), "Operator $gt must have a property as a direct parent.");
        assert_eq!(err.path(), "$gt");
    }

    #[test]
    fn test_upstream_rule_walks_through_elem_match() {
        let (tree, c) = nested("$eq");
        assert!(run(Rule::UpstreamMustBePropertyOrAllOrElemMatch, &tree, c, "$eq", json!(1)).is_ok());
        let (tree, c) = top_level("$eq");
        assert!(run(Rule::UpstreamMustBePropertyOrAllOrElemMatch, &tree, c, "$eq", json!(1)).is_err());
    }

    #[test]
    fn test_logical_placement() {
        let (tree, c) = top_level("$or");
        assert!(run(Rule::MustBeTopLevelOrInsideLogical, &tree, c, "$or", json!([{}])).is_ok());
        let (tree, c) = nested("$or");
        let err = run(Rule::MustBeTopLevelOrInsideLogical, &tree, c, "$or", json!([{}])).unwrap_err();
        assert_eq!(err.reason(), "Operator $or can only be nested within $and/$or/$elemMatch.");
    }

    #[test]
    fn test_conditions_array() {
        let (tree, c) = top_level("$and");
        let err = run(Rule::MustBeArrayOfConditions, &tree, c, "$and", json!([])).unwrap_err();
        assert_eq!(err.reason(), "Operator $and must contain at least 1 element.");
        let err = run(Rule::MustBeArrayOfConditions, &tree, c, "$and", json!([1])).unwrap_err();
        assert_eq!(err.reason(), "Operator $and elements must be objects.");
        let many: Vec<Value> = (0..101).map(|_| json!({})).collect();
        let err = run(Rule::MustBeArrayOfConditions, &tree, c, "$and", Value::Array(many)).unwrap_err();
        assert_eq!(err.reason(), "Maximum $and count (100) exceeded.");
    }

    #[test]
    fn test_size_templates() {
        let (tree, c) = nested("$cond");
        assert!(run(Rule::ArrayOfSize(3), &tree, c, "$cond", json!([1, 2, 3])).is_ok());
        let err = run(Rule::ArrayOfSize(3), &tree, c, "$cond", json!([1])).unwrap_err();
        assert_eq!(err.reason(), "$cond requires an array with exactly 3 elements.");
        let err = run(Rule::ArrayOfLengthBetween(2, 3), &tree, c, "$slice", json!([1])).unwrap_err();
        assert_eq!(err.reason(), "$slice requires an array with 2 to 3 elements.");
    }

    #[test]
    fn test_validate_regexp() {
        let limits = Limits::default();
        let regex = validate_regexp(&json!("/^a/i"), &limits, "c_name").unwrap();
        assert_eq!(regex.options, "i");
        let err = validate_regexp(&json!(""), &limits, "c_name").unwrap_err();
        assert!(err.reason().starts_with("Pattern () for $regex"));
        let err = validate_regexp(&json!("abc"), &limits, "c_name").unwrap_err();
        assert_eq!(err.reason(), "Invalid operator $regex pattern: abc");
    }
}
