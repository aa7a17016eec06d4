// queryforge-core/src/stage/matching/narrowing.rs
// Candidate model and property narrowing for $match

use super::operators::{CompareOp, MatchOp};
use super::MatchStage;
use crate::error::{CompileError, Result};
use crate::property::{
    find_property, intersect_models, merge_and_intersect, merge_and_union, union_models, CandidateProperty,
};
use crate::regex_cache::QueryRegex;
use crate::schema::ModelId;
use crate::stage::discriminator_allows;
use crate::tree::{ComponentId, RValue, ValueId};
use crate::log_trace;
use serde_json::Value;

/// Top-level fields that select models rather than properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discriminator {
    Object,
    Type,
}

impl Discriminator {
    fn for_path(path: &str) -> Option<Self> {
        match path {
            "object" => Some(Discriminator::Object),
            "type" => Some(Discriminator::Type),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Discriminator::Object => "object",
            Discriminator::Type => "type",
        }
    }
}

/// Test applied to an object, type or set document name
#[derive(Debug, Clone)]
pub(super) enum NameTest {
    Any,
    Compare(CompareOp, Option<String>),
    Regex(QueryRegex),
    NoneOf(Vec<NameTest>),
}

impl NameTest {
    fn from_value(value: &Value, op: CompareOp, allow_null: bool) -> Option<NameTest> {
        if let Some(regex) = QueryRegex::from_value(value) {
            return Some(NameTest::Regex(regex));
        }
        match value {
            Value::String(s) => Some(NameTest::Compare(op, Some(s.clone()))),
            Value::Null if allow_null => Some(NameTest::Compare(op, None)),
            _ => None,
        }
    }

    fn matches(&self, name: Option<&str>) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Compare(op, expected) => match (name, expected.as_deref()) {
                (Some(actual), Some(expected)) => op.accepts(actual.cmp(expected)),
                (None, None) => op.accepts_missing(true),
                _ => op.accepts_missing(false),
            },
            NameTest::Regex(regex) => name.map_or(false, |n| regex.is_match(n)),
            NameTest::NoneOf(tests) => !tests.iter().any(|t| t.matches(name)),
        }
    }
}

/// How set discriminator nodes are filtered while resolving a property
pub(super) enum Discriminate<'v> {
    Compare(CompareOp, &'v Value),
    Exclude(Vec<&'v Value>),
    Keep,
}

impl Discriminate<'_> {
    fn name_test(&self) -> Option<NameTest> {
        match self {
            Discriminate::Keep => Some(NameTest::Any),
            Discriminate::Compare(op, value) => NameTest::from_value(value, *op, false),
            Discriminate::Exclude(values) => values
                .iter()
                .map(|v| NameTest::from_value(v, CompareOp::Eq, false))
                .collect::<Option<Vec<_>>>()
                .map(NameTest::NoneOf),
        }
    }

    fn shown(&self, path: &str) -> String {
        fn show(value: &Value) -> String {
            match (value, QueryRegex::from_value(value)) {
                (_, Some(regex)) => format!("/{}/{}", regex.pattern, regex.options),
                (Value::String(s), _) => s.clone(),
                (other, _) => other.to_string(),
            }
        }
        match self {
            Discriminate::Compare(_, value) => show(value),
            Discriminate::Exclude(values) => values.iter().map(|v| show(v)).collect::<Vec<_>>().join(","),
            Discriminate::Keep => path.to_string(),
        }
    }
}

impl MatchStage<'_, '_, '_> {
    // ========================================================================
    // MODELS
    // ========================================================================

    /// Candidate models at `c`: the parent's models narrowed by `c`'s value
    pub(super) fn models(&self, c: ComponentId) -> Result<Vec<ModelId>> {
        if let Some(models) = self.models.borrow().get(&c) {
            return Ok(models.clone());
        }
        let resolved = if self.tree.is_root(c) {
            let value = self.value_id(c)?;
            self.expression_models(value, &self.ctx.input_models)?
        } else {
            let parent_models = self.models(self.parent(c))?;
            self.component_models(c, &parent_models)?
        };
        self.models.borrow_mut().insert(c, resolved.clone());
        Ok(resolved)
    }

    fn component_models(&self, c: ComponentId, models: &[ModelId]) -> Result<Vec<ModelId>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }
        let value = self.value_id(c)?;
        match self.tree.rvalue(value) {
            RValue::Expression(_) => self.expression_models(value, models),
            RValue::Array(elements) => {
                let mut groups = Vec::with_capacity(elements.len());
                for element in elements {
                    groups.push(match self.tree.rvalue(*element) {
                        RValue::Expression(_) => self.expression_models(*element, models)?,
                        _ => models.to_vec(),
                    });
                }
                Ok(union_models(&groups))
            }
            _ => Ok(models.to_vec()),
        }
    }

    fn expression_models(&self, expression: ValueId, models: &[ModelId]) -> Result<Vec<ModelId>> {
        let mut groups = Vec::new();
        for child in self.tree.children(expression) {
            groups.push(self.child_models(*child, models)?);
        }
        Ok(intersect_models(&groups))
    }

    fn child_models(&self, c: ComponentId, models: &[ModelId]) -> Result<Vec<ModelId>> {
        if let Some(op) = self.op(c) {
            return self.operator_models(c, op, models);
        }
        let field = match Discriminator::for_path(&self.tree.component(c).property_fullpath) {
            Some(field) => field,
            None => return Ok(models.to_vec()),
        };
        let value = self.value_id(c)?;
        match self.tree.rvalue(value) {
            RValue::Simple(v) => {
                let test = self.name_test_for(c, field, v, CompareOp::Eq)?;
                self.models_matching(c, field, &test, models)
            }
            RValue::Expression(_) => self.expression_models(value, models),
            RValue::Variable(_) => Ok(models.to_vec()),
            _ => Err(CompileError::invalid(
                format!("$match {} property must be a simple value or an expression", field.as_str()),
                self.fullpath(c),
            )),
        }
    }

    fn operator_models(&self, c: ComponentId, op: MatchOp, models: &[ModelId]) -> Result<Vec<ModelId>> {
        let value = self.value_id(c)?;
        if self.tree.rvalue(value).is_variable() {
            return Ok(models.to_vec());
        }
        let field = Discriminator::for_path(&self.tree.component(c).property_fullpath);

        match op {
            MatchOp::Eq | MatchOp::Ne | MatchOp::Gt | MatchOp::Gte | MatchOp::Lt | MatchOp::Lte | MatchOp::Regex => {
                let field = match field {
                    Some(field) => field,
                    None => return Ok(models.to_vec()),
                };
                let v = match self.tree.rvalue(value) {
                    RValue::Simple(v) => v,
                    _ => {
                        return Err(CompileError::invalid(
                            format!("{} object property must be a simple value.", op.key()),
                            self.fullpath(c),
                        ))
                    }
                };
                let compare = op.compare_op().unwrap_or(CompareOp::Eq);
                let test = self.name_test_for(c, field, v, compare)?;
                self.models_matching(c, field, &test, models)
            }
            MatchOp::In | MatchOp::Nin => {
                let elements = self.array_elements(c, value, op)?;
                let field = match field {
                    Some(field) => field,
                    None => return Ok(models.to_vec()),
                };
                if op == MatchOp::Nin {
                    let mut tests = Vec::with_capacity(elements.len());
                    for element in elements {
                        match self.tree.rvalue(*element) {
                            RValue::Simple(v) => tests.push(self.name_test_for(c, field, v, CompareOp::Eq)?),
                            _ => return Ok(models.to_vec()),
                        }
                    }
                    return self.models_matching(c, field, &NameTest::NoneOf(tests), models);
                }
                let mut groups = Vec::with_capacity(elements.len());
                for element in elements {
                    groups.push(match self.tree.rvalue(*element) {
                        RValue::Simple(v) => {
                            let test = self.name_test_for(c, field, v, CompareOp::Eq)?;
                            self.models_matching(c, field, &test, models)?
                        }
                        _ => models.to_vec(),
                    });
                }
                Ok(union_models(&groups))
            }
            MatchOp::And | MatchOp::Or | MatchOp::All => {
                let elements = self.array_elements(c, value, op)?;
                let mut groups = Vec::with_capacity(elements.len());
                for element in elements {
                    groups.push(match self.tree.rvalue(*element) {
                        RValue::Expression(_) => self.expression_models(*element, models)?,
                        _ => models.to_vec(),
                    });
                }
                if op.is_conjunction() {
                    Ok(intersect_models(&groups))
                } else {
                    Ok(union_models(&groups))
                }
            }
            MatchOp::ElemMatch | MatchOp::Type | MatchOp::Exists | MatchOp::Size | MatchOp::Within => {
                Ok(models.to_vec())
            }
        }
    }

    fn array_elements(&self, c: ComponentId, value: ValueId, op: MatchOp) -> Result<&[ValueId]> {
        match self.tree.rvalue(value) {
            RValue::Array(elements) => Ok(elements),
            _ => Err(CompileError::invalid(
                format!("{} property expects an array", op.key()),
                self.fullpath(c),
            )),
        }
    }

    fn name_test_for(&self, c: ComponentId, field: Discriminator, value: &Value, op: CompareOp) -> Result<NameTest> {
        let allow_null = field == Discriminator::Type;
        NameTest::from_value(value, op, allow_null).ok_or_else(|| {
            let expected = if allow_null { "a string or regexp or null" } else { "a string or regexp" };
            CompileError::invalid(
                format!("$match {} property must be {}", field.as_str(), expected),
                self.fullpath(c),
            )
        })
    }

    fn models_matching(
        &self,
        c: ComponentId,
        field: Discriminator,
        test: &NameTest,
        models: &[ModelId],
    ) -> Result<Vec<ModelId>> {
        let catalog = self.ctx.catalog;
        let strict = self.ctx.strict();
        match field {
            Discriminator::Object => {
                let found: Vec<ModelId> = models
                    .iter()
                    .filter(|m| test.matches(Some(&catalog.model(**m).object_name)))
                    .copied()
                    .collect();
                if found.is_empty() && strict {
                    return Err(CompileError::invalid(
                        "strict: the object does exist in the list of candidates.",
                        self.fullpath(c),
                    ));
                }
                Ok(found)
            }
            Discriminator::Type => {
                let mut any_typed = false;
                let mut found = Vec::new();
                for m in models {
                    let model = catalog.model(*m);
                    if !model.is_typed() {
                        continue;
                    }
                    any_typed = true;
                    if test.matches(model.type_name.as_deref()) {
                        found.push(*m);
                    }
                }
                if strict {
                    if !any_typed && matches!(test, NameTest::Compare(_, None)) {
                        return Err(CompileError::invalid(
                            "strict: null type cannot be used where there are no typed candidate objects.",
                            self.fullpath(c),
                        ));
                    }
                    if found.is_empty() {
                        return Err(CompileError::invalid(
                            "strict: the type does not exist in the list of candidate objects.",
                            self.fullpath(c),
                        ));
                    }
                }
                Ok(found)
            }
        }
    }

    // ========================================================================
    // PROPERTIES
    // ========================================================================

    /// Candidate properties at `c`, resolved against the parent's properties.
    /// Resolution runs twice so later siblings narrow earlier ones.
    pub(super) fn properties(&self, c: ComponentId) -> Result<Vec<CandidateProperty>> {
        if let Some(properties) = self.properties.borrow().get(&c) {
            return Ok(properties.clone());
        }
        let models = self.models(c)?;
        let parent = if self.tree.is_root(c) {
            self.ctx.input_properties.clone()
        } else {
            self.properties(self.parent(c))?
        };
        let once = self.component_properties(c, &models, parent)?;
        let resolved = self.component_properties(c, &models, once)?;
        self.properties.borrow_mut().insert(c, resolved.clone());
        Ok(resolved)
    }

    fn component_properties(
        &self,
        c: ComponentId,
        models: &[ModelId],
        properties: Vec<CandidateProperty>,
    ) -> Result<Vec<CandidateProperty>> {
        let value = self.value_id(c)?;
        match self.tree.rvalue(value) {
            RValue::Expression(_) => self.expression_properties(value, models, properties, "$match type property"),
            RValue::Array(elements) => {
                let mut groups = Vec::with_capacity(elements.len());
                for element in elements {
                    groups.push(match self.tree.rvalue(*element) {
                        RValue::Expression(_) => self.expression_properties(
                            *element,
                            models,
                            properties.clone(),
                            "$match type property",
                        )?,
                        _ => properties.clone(),
                    });
                }
                merge_and_union(groups)
            }
            _ => Ok(properties),
        }
    }

    fn expression_properties(
        &self,
        expression: ValueId,
        models: &[ModelId],
        properties: Vec<CandidateProperty>,
        label: &str,
    ) -> Result<Vec<CandidateProperty>> {
        let mut groups = Vec::new();
        for child in self.tree.children(expression) {
            groups.push(self.child_properties(*child, models, properties.clone(), label)?);
        }
        merge_and_intersect(groups)
    }

    fn child_properties(
        &self,
        c: ComponentId,
        models: &[ModelId],
        properties: Vec<CandidateProperty>,
        label: &str,
    ) -> Result<Vec<CandidateProperty>> {
        if let Some(op) = self.op(c) {
            return self.operator_properties(c, op, models, properties);
        }
        let value = self.value_id(c)?;
        match self.tree.rvalue(value) {
            RValue::Simple(v) => self.match_property_nodes(c, models, properties, Discriminate::Compare(CompareOp::Eq, v)),
            RValue::Variable(_) => self.match_property_nodes(c, models, properties, Discriminate::Keep),
            RValue::Expression(_) => self.expression_properties(value, models, properties, label),
            _ => Err(CompileError::invalid(
                format!("{} must be a simple value or an expression", label),
                self.fullpath(c),
            )),
        }
    }

    fn operator_properties(
        &self,
        c: ComponentId,
        op: MatchOp,
        models: &[ModelId],
        properties: Vec<CandidateProperty>,
    ) -> Result<Vec<CandidateProperty>> {
        let value = self.value_id(c)?;
        let rvalue = self.tree.rvalue(value);
        if rvalue.is_variable() {
            return self.match_property_nodes(c, models, properties, Discriminate::Keep);
        }

        match op {
            MatchOp::Eq
            | MatchOp::Ne
            | MatchOp::Gt
            | MatchOp::Gte
            | MatchOp::Lt
            | MatchOp::Lte
            | MatchOp::Regex
            | MatchOp::Type
            | MatchOp::Exists
            | MatchOp::Size
            | MatchOp::Within => {
                let v = match rvalue {
                    RValue::Simple(v) => v,
                    _ => {
                        return Err(CompileError::invalid(
                            format!("{} property must be a simple value.", op.key()),
                            self.fullpath(c),
                        ))
                    }
                };
                let discriminate = match op.compare_op() {
                    Some(compare) => Discriminate::Compare(compare, v),
                    None if op == MatchOp::Regex => Discriminate::Compare(CompareOp::Eq, v),
                    None => Discriminate::Keep,
                };
                self.match_property_nodes(c, models, properties, discriminate)
            }
            MatchOp::In => {
                let elements = self.array_elements(c, value, op)?;
                if elements.is_empty() {
                    return Ok(properties);
                }
                let mut groups = Vec::with_capacity(elements.len());
                for element in elements {
                    let discriminate = match self.tree.rvalue(*element) {
                        RValue::Simple(v) => Discriminate::Compare(CompareOp::Eq, v),
                        _ => Discriminate::Keep,
                    };
                    groups.push(self.match_property_nodes(c, models, properties.clone(), discriminate)?);
                }
                merge_and_union(groups)
            }
            MatchOp::Nin => {
                let elements = self.array_elements(c, value, op)?;
                if elements.is_empty() {
                    return Ok(properties);
                }
                let mut excluded = Vec::with_capacity(elements.len());
                for element in elements {
                    match self.tree.rvalue(*element) {
                        RValue::Simple(v) => excluded.push(v),
                        _ => return self.match_property_nodes(c, models, properties, Discriminate::Keep),
                    }
                }
                self.match_property_nodes(c, models, properties, Discriminate::Exclude(excluded))
            }
            MatchOp::And | MatchOp::Or | MatchOp::All => {
                let elements = self.array_elements(c, value, op)?;
                let mut groups = Vec::with_capacity(elements.len());
                for element in elements {
                    groups.push(match self.tree.rvalue(*element) {
                        RValue::Expression(_) => self.expression_properties(
                            *element,
                            models,
                            properties.clone(),
                            "$match type property",
                        )?,
                        RValue::Simple(v) if op == MatchOp::All => self.match_property_nodes(
                            c,
                            models,
                            properties.clone(),
                            Discriminate::Compare(CompareOp::Eq, v),
                        )?,
                        _ => properties.clone(),
                    });
                }
                if op.is_conjunction() {
                    merge_and_intersect(groups)
                } else {
                    merge_and_union(groups)
                }
            }
            MatchOp::ElemMatch => match rvalue {
                RValue::Expression(_) => self.expression_properties(value, models, properties, "$elemMatch property"),
                _ => Ok(properties),
            },
        }
    }

    /// Resolve the property at `c`'s path and narrow its set discriminator
    /// nodes. An unchanged existing property leaves the list untouched.
    fn match_property_nodes(
        &self,
        c: ComponentId,
        models: &[ModelId],
        properties: Vec<CandidateProperty>,
        discriminate: Discriminate<'_>,
    ) -> Result<Vec<CandidateProperty>> {
        let catalog = self.ctx.catalog;
        let path = self.tree.component(c).property_fullpath.clone();
        let existing = find_property(&properties, &path).cloned();
        let candidates = match &existing {
            Some(property) => property.nodes.clone(),
            None => catalog.gather_nodes(models, &path),
        };

        let mut has_discriminators = false;
        let mut found = Vec::with_capacity(candidates.len());
        let mut test: Option<NameTest> = None;
        for node in &candidates {
            let key = match catalog.discriminator_key(*node) {
                None => {
                    found.push(*node);
                    continue;
                }
                Some(key) => key,
            };
            has_discriminators = true;
            if catalog.node(*node).name == key {
                if test.is_none() {
                    test = Some(discriminate.name_test().ok_or_else(|| {
                        CompileError::invalid(
                            "$match discriminator property must be a string or regexp",
                            self.fullpath(c),
                        )
                    })?);
                }
                if test.as_ref().map_or(false, |t| t.matches(catalog.document_name(*node))) {
                    found.push(*node);
                }
            } else if discriminator_allows(catalog, &properties, *node) {
                found.push(*node);
            }
        }

        let unchanged = !has_discriminators || found.len() == candidates.len();
        let resolved = if unchanged { candidates } else { found };
        if resolved.is_empty() && self.ctx.strict() {
            return Err(CompileError::invalid(
                format!(
                    "strict: there are no properties that could match {} in $match stage {}",
                    discriminate.shown(&path),
                    self.ctx.position
                ),
                self.fullpath(c),
            ));
        }
        if existing.is_some() && unchanged {
            return Ok(properties);
        }

        log_trace!("$match property {} resolved to {} nodes", path, resolved.len());
        let is_array = existing.and_then(|p| p.is_array);
        let mut out: Vec<CandidateProperty> = properties.into_iter().filter(|p| p.path != path).collect();
        out.push(CandidateProperty::new(path, resolved).with_array(is_array));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CompilerOptions;
    use crate::schema::Catalog;
    use crate::stage::matching::compile;
    use crate::stage::testing::{context, fixture};
    use crate::stage::StageKind;
    use serde_json::json;

    fn narrowed(query: Value) -> Result<(Vec<String>, Vec<CandidateProperty>)> {
        let schema = fixture();
        let catalog = Catalog::new(&schema);
        let options = CompilerOptions::new("c_pet").with_allowed_restricted_ops(["*"]);
        let ctx = context(&catalog, &options, StageKind::Match, false);
        let out = compile(&query, &ctx)?;
        let names = out.models.iter().map(|m| catalog.model(*m).qualified_name()).collect();
        Ok((names, out.properties))
    }

    fn names(query: Value) -> Vec<String> {
        narrowed(query).unwrap().0
    }

    // ========== Name tests ==========

    #[test]
    fn test_name_tests() {
        let eq = NameTest::Compare(CompareOp::Eq, Some("c_dog".into()));
        assert!(eq.matches(Some("c_dog")));
        assert!(!eq.matches(None));

        let null = NameTest::Compare(CompareOp::Eq, None);
        assert!(null.matches(None));
        assert!(!null.matches(Some("c_dog")));

        let none = NameTest::NoneOf(vec![eq.clone()]);
        assert!(none.matches(Some("c_cat")));
        assert!(!none.matches(Some("c_dog")));

        let regex = NameTest::Regex(QueryRegex::parse("/^c_d/").unwrap());
        assert!(regex.matches(Some("c_dog")));
    }

    // ========== Models ==========

    #[test]
    fn test_type_narrowing() {
        assert_eq!(names(json!({"type": "c_dog"})), vec!["c_pet#c_dog"]);
        assert_eq!(names(json!({"type": null})), vec!["c_pet"]);
        assert_eq!(
            names(json!({"type": {"$in": ["c_cat", "c_dog"]}})),
            vec!["c_pet#c_cat", "c_pet#c_dog"]
        );
        assert_eq!(
            names(json!({"type": {"$nin": ["c_dog"]}})),
            vec!["c_pet", "c_pet#c_cat"]
        );
        assert_eq!(names(json!({"type": {"$regex": "/^c_c/"}})), vec!["c_pet#c_cat"]);
    }

    #[test]
    fn test_type_narrowing_errors() {
        let err = narrowed(json!({"type": "c_bird"})).unwrap_err();
        assert_eq!(err.reason(), "strict: the type does not exist in the list of candidate objects.");
        let err = narrowed(json!({"object": "c_note"})).unwrap_err();
        assert_eq!(err.reason(), "strict: the object does exist in the list of candidates.");
        let err = narrowed(json!({"type": 1})).unwrap_err();
        assert_eq!(err.reason(), "$match type property must be a string or regexp or null");
    }

    #[test]
    fn test_or_unions_and_intersects() {
        assert_eq!(
            names(json!({"$or": [{"type": "c_dog"}, {"type": "c_cat"}]})),
            vec!["c_pet#c_dog", "c_pet#c_cat"]
        );
        assert!(narrowed(json!({"$and": [{"type": "c_dog"}, {"type": "c_cat"}]})).is_err());
    }

    #[test]
    fn test_typed_properties_follow_models() {
        let (_, properties) = narrowed(json!({"type": "c_dog", "c_flag": true})).unwrap();
        let flag = find_property(&properties, "c_flag").unwrap();
        assert_eq!(flag.nodes.len(), 1);

        let (_, properties) = narrowed(json!({"c_flag": true})).unwrap();
        assert_eq!(find_property(&properties, "c_flag").unwrap().nodes.len(), 2);
    }

    // ========== Set discriminators ==========

    #[test]
    fn test_set_discriminator_narrows_documents() {
        let (_, properties) = narrowed(json!({"c_set.name": "c_a"})).unwrap();
        let name = find_property(&properties, "c_set.name").unwrap();
        assert_eq!(name.nodes.len(), 1);

        let (_, properties) = narrowed(json!({"c_set.name": {"$in": ["c_a", "c_b"]}})).unwrap();
        assert_eq!(find_property(&properties, "c_set.name").unwrap().nodes.len(), 2);

        let err = narrowed(json!({"c_set.name": "c_z"})).unwrap_err();
        assert_eq!(
            err.reason(),
            "strict: there are no properties that could match c_z in $match stage 0"
        );
    }

    #[test]
    fn test_excluded_discriminators() {
        let (_, properties) = narrowed(json!({"c_set.name": {"$nin": ["c_a"]}})).unwrap();
        let name = find_property(&properties, "c_set.name").unwrap();
        assert_eq!(name.nodes.len(), 1);
    }
}
