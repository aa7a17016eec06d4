// queryforge-core/src/stage/expression/generate.rs
// Output type inference and read checks for pipeline expressions

use super::{Accumulator, AccumulatorOutput, PipelineExpression, PipelineOp as Op};
use crate::error::{CompileError, Result};
use crate::log_trace;
use crate::schema::{AccessLevel, NodeId, ProjectedNode, ProjectedSource, TypeName};
use crate::stage::{filter_by_discriminators, gather_candidate_nodes, no_candidates, Expansion, StageKind};
use crate::tree::{ComponentId, RValue, ValueId, ROOT};
use serde_json::Value;

fn unknown() -> ProjectedNode {
    ProjectedNode::new("").typed(TypeName::Unknown)
}

fn scalar(type_name: TypeName) -> ProjectedNode {
    ProjectedNode::new("").typed(type_name).with_array(Some(false))
}

/// Type of a literal as written
fn natural_type(value: &Value) -> TypeName {
    match value {
        Value::Null => TypeName::Unknown,
        Value::Bool(_) => TypeName::Boolean,
        Value::Number(_) => TypeName::Number,
        Value::String(_) => TypeName::String,
        Value::Array(items) => items.first().map_or(TypeName::Unknown, natural_type),
        Value::Object(map) if map.len() == 1 => {
            if map.contains_key("$date") {
                TypeName::Date
            } else if map.contains_key("$oid") {
                TypeName::ObjectId
            } else if let Some(inner) = map.get("$literal") {
                natural_type(inner)
            } else {
                TypeName::Document
            }
        }
        Value::Object(_) => TypeName::Document,
    }
}

fn literal_node(value: &Value) -> ProjectedNode {
    let value = match value {
        Value::Object(map) if map.len() == 1 && map.contains_key("$literal") => &map["$literal"],
        other => other,
    };
    ProjectedNode::new("")
        .typed(natural_type(value))
        .with_array(Some(value.is_array()))
}

fn is_vague(type_name: TypeName) -> bool {
    matches!(type_name, TypeName::Unknown | TypeName::Any)
}

impl<'a, 'c, 's> PipelineExpression<'a, 'c, 's> {
    /// One projected node per output field of the stage
    pub fn generate(&self) -> Result<Vec<ProjectedNode>> {
        let root = self.value_id(ROOT)?;
        self.tree
            .children(root)
            .iter()
            .map(|c| self.generate_field(*c))
            .collect()
    }

    fn generate_field(&self, c: ComponentId) -> Result<ProjectedNode> {
        let v = self.value_id(c)?;
        if self.kind() == StageKind::Project {
            self.check_rename(c, v)?;
        }
        let mut node = self.generate_value(v)?;
        node.name = self.tree.key(c).to_string();
        log_trace!(
            "{} output {} is {}",
            self.kind().key(),
            self.fullpath(c),
            node.public_type_name(self.ctx.catalog)
        );
        Ok(node)
    }

    /// `$project` may not reuse the name of an existing property for something else
    fn check_rename(&self, c: ComponentId, v: ValueId) -> Result<()> {
        let path = &self.tree.component(c).property_fullpath;
        let exists = || !self.ctx.catalog.gather_nodes(&self.ctx.input_models, path).is_empty();
        match self.tree.rvalue(v) {
            RValue::Property(source) if source != path && exists() => {
                Err(CompileError::invalid("Cannot rename built-in fields.", self.fullpath(c)))
            }
            RValue::Expression(children) => match children.as_slice() {
                [only] if self.tree.is_operator(*only) && self.tree.key(*only) != Op::Expand.key() && exists() => {
                    Err(CompileError::invalid("Cannot rename existing property fields.", self.fullpath(c)))
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn generate_value(&self, v: ValueId) -> Result<ProjectedNode> {
        match self.tree.rvalue(v) {
            RValue::Variable(_) | RValue::Raw(_) => Ok(unknown()),
            RValue::Simple(value) => {
                if self.in_operator(v) || self.kind() == StageKind::Group {
                    Ok(literal_node(value))
                } else {
                    let c = self.tree.value(v).component;
                    let path = self.tree.component(c).property_fullpath.clone();
                    self.resolve(v, &path, true)
                }
            }
            RValue::Property(path) => self.resolve(v, path, false),
            RValue::Array(elements) => {
                let items = elements
                    .iter()
                    .map(|e| self.generate_value(*e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ProjectedNode::new("")
                    .typed(self.agreed_type(&items))
                    .with_array(Some(true)))
            }
            RValue::Expression(children) => match children.as_slice() {
                [only] if self.tree.is_operator(*only) => self.generate_operator(*only),
                _ => self.generate_document(v, children),
            },
        }
    }

    /// A nested object of output fields
    fn generate_document(&self, v: ValueId, children: &[ComponentId]) -> Result<ProjectedNode> {
        let properties = children
            .iter()
            .map(|child| self.generate_field(*child))
            .collect::<Result<Vec<_>>>()?;
        let mut node = ProjectedNode::new("").document(properties);
        if self.kind() != StageKind::Group {
            let c = self.tree.value(v).component;
            let (nodes, is_array) = gather_candidate_nodes(self.ctx, &self.tree.component(c).property_fullpath);
            node.sources = filter_by_discriminators(self.ctx, nodes)
                .into_iter()
                .map(ProjectedSource::Node)
                .collect();
            node.array = is_array;
        }
        Ok(node)
    }

    // ========================================================================
    // PROPERTY RESOLUTION
    // ========================================================================

    /// Resolve and authorize the schema nodes a value reads.
    ///
    /// `inclusion` marks a plain `field: 1`, which may name a virtual or
    /// reader-backed property itself; anything computed from a property needs
    /// concrete data.
    fn resolve(&self, v: ValueId, path: &str, inclusion: bool) -> Result<ProjectedNode> {
        let c = self.tree.value(v).component;
        let key = self.tree.key(c).to_string();
        let fullpath = self.fullpath(c);
        let catalog = self.ctx.catalog;

        let (nodes, is_array) = gather_candidate_nodes(self.ctx, path);
        let nodes = filter_by_discriminators(self.ctx, nodes);
        if nodes.is_empty() {
            if self.ctx.strict() {
                return Err(no_candidates("match", path, &fullpath));
            }
            return Ok(unknown());
        }

        let bump = self.kind() == StageKind::Group;
        for id in &nodes {
            for ancestor in catalog.lineage(*id) {
                self.ctx.authorize(ancestor, bump)?;
                let n = catalog.node(ancestor);
                if (n.group_reader || n.is_virtual) && !(inclusion && ancestor == *id) {
                    return Err(CompileError::access_denied(
                        format!(
                            "\"{}\" cannot project on a property not backed by concrete data ({})",
                            key, n.fqpp
                        ),
                        fullpath,
                    ));
                }
            }
            self.check_amalgamation(*id, &key, &fullpath)?;
        }

        if self.in_operator(v) {
            let readers: Vec<&str> = nodes
                .iter()
                .map(|id| catalog.node(*id))
                .filter(|n| n.is_reader_backed())
                .map(|n| n.fqpp.as_str())
                .collect();
            if !readers.is_empty() {
                return Err(CompileError::access_denied(
                    format!(
                        "\"{}\" cannot select on a property not backed by concrete data ({}). try matching the property out of projection candidacy.",
                        key,
                        readers.join(", ")
                    ),
                    fullpath,
                ));
            }
            if self.ctx.strict() {
                if let Some(any) = nodes.iter().map(|id| catalog.node(*id)).find(|n| n.type_name == TypeName::Any) {
                    return Err(CompileError::invalid(
                        format!("Any type property {} cannot be used in this expression.", any.fqpp),
                        fullpath,
                    ));
                }
            }
        }

        if nodes.iter().all(|id| catalog.node(*id).localized) {
            let locale = catalog
                .node(nodes[0])
                .fixed_locale
                .clone()
                .unwrap_or_else(|| self.ctx.options.current_locale.clone());
            self.localized.borrow_mut().insert(v, locale);
        }

        Ok(ProjectedNode::new("")
            .with_sources(nodes.into_iter().map(ProjectedSource::Node).collect())
            .with_array(is_array))
    }

    /// Projected nodes built from several properties must be readable as a whole
    fn check_amalgamation(&self, id: NodeId, key: &str, fullpath: &str) -> Result<()> {
        let catalog = self.ctx.catalog;
        let node = catalog.node(id);
        if !node.projected {
            return Ok(());
        }
        let amalgamated = node.sources.len() > 1;
        for source in &node.sources {
            let n = catalog.node(*source);
            if !n.readable {
                return Err(CompileError::not_found("Property not found.", fullpath));
            }
            if n.acl.is_some() && amalgamated {
                return Err(CompileError::unsupported(
                    "Property may not be used due to ambiguous access control list combining in projection.",
                    fullpath,
                ));
            }
            if n.read_access == AccessLevel::System && !self.ctx.options.allow_system_access {
                return Err(CompileError::unsupported(
                    "Property may contain hidden or inaccessible values, so cannot be used in the projection. try projecting individual constituent properties.",
                    fullpath,
                ));
            }
            if amalgamated && n.is_reader_backed() {
                return Err(CompileError::access_denied(
                    format!(
                        "\"{}\" cannot select on a property {} not backed by concrete data inside of a property amalgamation.",
                        key, n.fqpp
                    ),
                    fullpath,
                ));
            }
            if self.kind() == StageKind::Group && n.acl.is_none() {
                self.ctx.bump_access(n.read_access);
            }
        }
        Ok(())
    }

    // ========================================================================
    // OPERATORS
    // ========================================================================

    fn arguments(&self, v: ValueId) -> Result<Vec<ProjectedNode>> {
        match self.tree.rvalue(v) {
            RValue::Array(elements) => elements.iter().map(|e| self.generate_value(*e)).collect(),
            RValue::Variable(_) => Ok(Vec::new()),
            _ => Ok(vec![self.generate_value(v)?]),
        }
    }

    fn generate_operator(&self, c: ComponentId) -> Result<ProjectedNode> {
        if let Some(accumulator) = self.accumulator(c) {
            return self.generate_accumulator(c, accumulator);
        }
        let op = self.pipeline_op(c)?;
        let v = self.value_id(c)?;
        if op == Op::Expand {
            return self.generate_expand(c, v);
        }
        let args = self.arguments(v)?;
        let key = op.key();
        let path = self.fullpath(c);
        let first = || args.get(..1).unwrap_or(&[]);

        let node = match op {
            Op::Sum | Op::Avg | Op::StdDevPop | Op::StdDevSamp => {
                self.expect_inputs(key, &path, &args, &[TypeName::Number])?;
                scalar(TypeName::Number)
            }
            Op::Max | Op::Min | Op::IfNull => self.merged(&args),
            Op::Cond => self.merged(args.get(1..).unwrap_or(&[])),
            Op::Literal => match self.tree.rvalue(v) {
                RValue::Simple(value) => literal_node(value),
                _ => unknown(),
            },
            Op::String | Op::Number | Op::Integer | Op::Boolean | Op::Date | Op::ObjectId => {
                scalar(op.literal_type().unwrap_or(TypeName::Unknown))
            }
            Op::Array => match self.tree.rvalue(v) {
                RValue::Simple(value) => literal_node(value),
                _ => unknown().with_array(Some(true)),
            },
            Op::Object => scalar(TypeName::Document),
            Op::And | Op::Or | Op::Not | Op::AnyElementTrue | Op::AllElementsTrue | Op::IsArray => {
                scalar(TypeName::Boolean)
            }
            Op::Eq | Op::Gt | Op::Gte | Op::Lt | Op::Lte | Op::Ne => scalar(TypeName::Boolean),
            Op::SetEquals | Op::SetIsSubset => {
                self.expect_arrays(key, &path, &args, true)?;
                scalar(TypeName::Boolean)
            }
            Op::SetIntersection | Op::SetUnion | Op::SetDifference | Op::ConcatArrays => {
                self.expect_arrays(key, &path, &args, true)?;
                ProjectedNode::new("")
                    .typed(self.agreed_type(&args))
                    .with_array(Some(true))
            }
            Op::Cmp => scalar(TypeName::Number),
            Op::Strcasecmp => {
                self.expect_inputs(key, &path, &args, &[TypeName::String])?;
                scalar(TypeName::Number)
            }
            Op::Trunc | Op::Sqrt | Op::Ln | Op::Floor | Op::Exp | Op::Ceil | Op::Abs | Op::Multiply
            | Op::Divide | Op::Mod | Op::Pow | Op::Log => {
                self.expect_inputs(key, &path, &args, &[TypeName::Number])?;
                self.expect_arrays(key, &path, &args, false)?;
                scalar(TypeName::Number)
            }
            Op::Add => self.add_output(&args, &path)?,
            Op::Subtract => self.subtract_output(&args, &path)?,
            Op::Concat | Op::ToLower | Op::ToUpper => {
                self.expect_inputs(key, &path, &args, &[TypeName::String])?;
                self.expect_arrays(key, &path, &args, false)?;
                scalar(TypeName::String)
            }
            Op::Substr => {
                self.expect_inputs(key, &path, first(), &[TypeName::String])?;
                scalar(TypeName::String)
            }
            Op::Size => {
                self.expect_arrays(key, &path, &args, true)?;
                scalar(TypeName::Number)
            }
            Op::ArrayElemAt | Op::Slice => {
                self.expect_arrays(key, &path, first(), true)?;
                let mut element = args.first().cloned().unwrap_or_else(unknown);
                element.array = Some(op == Op::Slice);
                element
            }
            Op::DayOfYear | Op::DayOfMonth | Op::DayOfWeek | Op::Year | Op::Month | Op::Week | Op::Hour
            | Op::Minute | Op::Second | Op::Millisecond => {
                self.expect_inputs(key, &path, &args, &[TypeName::Date])?;
                self.expect_arrays(key, &path, &args, false)?;
                scalar(TypeName::Number)
            }
            Op::DateToString => {
                self.expect_inputs(key, &path, args.get(1..2).unwrap_or(&[]), &[TypeName::Date])?;
                scalar(TypeName::String)
            }
            Op::Expand => unknown(),
        };
        Ok(node)
    }

    fn generate_accumulator(&self, c: ComponentId, accumulator: Accumulator) -> Result<ProjectedNode> {
        let v = self.value_id(c)?;
        let arg = match self.tree.rvalue(v) {
            RValue::Variable(_) => unknown(),
            _ => self.generate_value(v)?,
        };
        let catalog = self.ctx.catalog;
        let key = accumulator.key();
        let path = self.fullpath(c);
        match accumulator.output() {
            AccumulatorOutput::Number => {
                if accumulator == Accumulator::Count {
                    if arg.is_array(catalog) == Some(true) {
                        self.counted_arrays.borrow_mut().insert(c);
                    }
                } else {
                    self.expect_inputs(key, &path, std::slice::from_ref(&arg), &[TypeName::Number])?;
                }
                Ok(scalar(TypeName::Number))
            }
            AccumulatorOutput::Source => Ok(arg),
            AccumulatorOutput::ArrayOfSource => Ok(ProjectedNode::new("")
                .typed(arg.type_name(catalog))
                .with_array(Some(true))),
        }
    }

    /// `field: {$expand: ...}` on an expandable reference
    fn generate_expand(&self, c: ComponentId, v: ValueId) -> Result<ProjectedNode> {
        let fullpath = self.fullpath(c);
        if let Some((stage, position)) = self.ctx.later_stage_of(&[StageKind::Group, StageKind::Unwind]) {
            return Err(CompileError::unsupported(
                format!(
                    "$expand must appear in the last transformational stage ({} {})",
                    stage.key(),
                    position
                ),
                fullpath,
            ));
        }
        let field = self.tree.parent_component(c).unwrap_or(ROOT);
        let path = self.tree.component(field).property_fullpath.clone();
        let node = self.resolve(v, &path, true)?;

        let catalog = self.ctx.catalog;
        let fqpps = node
            .concrete_sources(catalog)
            .iter()
            .map(|id| catalog.node(*id).fqpp.clone())
            .collect::<Vec<_>>()
            .join(", ");
        let with_arguments = matches!(self.tree.rvalue(v), RValue::Raw(_));
        match (node.type_name(catalog), node.is_array(catalog).unwrap_or(false)) {
            (TypeName::Reference, false) => {
                if !node.is_expandable(catalog) {
                    return Err(CompileError::unsupported(
                        format!("Expansion not allowed for {}", fqpps),
                        fullpath,
                    ));
                }
            }
            (TypeName::Reference, true) | (TypeName::List, _) => {
                if !with_arguments {
                    return Err(CompileError::unsupported(
                        "Using $expand with a Reference[] or List requires an object property with list arguments (pipeline, limit, etc...)",
                        fullpath,
                    ));
                }
            }
            _ => {
                return Err(CompileError::unsupported(
                    "$expand cannot be applied to References and Reference[] (List properties)",
                    fullpath,
                ))
            }
        }

        self.expansions.borrow_mut().push(Expansion {
            path,
            arguments: self.tree.underlying(v),
        });
        Ok(node)
    }

    // ========================================================================
    // TYPE CHECKS
    // ========================================================================

    /// The single type all `items` agree on
    fn agreed_type(&self, items: &[ProjectedNode]) -> TypeName {
        let mut types = items.iter().map(|item| item.type_name(self.ctx.catalog));
        match types.next() {
            Some(first) if types.all(|t| t == first) => first,
            _ => TypeName::Unknown,
        }
    }

    fn merged(&self, items: &[ProjectedNode]) -> ProjectedNode {
        let mut arrays = items.iter().map(|item| item.is_array(self.ctx.catalog));
        let array = match arrays.next() {
            Some(first) if arrays.all(|a| a == first) => first,
            _ => None,
        };
        ProjectedNode::new("")
            .typed(self.agreed_type(items))
            .with_array(array)
    }

    fn expect_inputs(&self, key: &str, path: &str, args: &[ProjectedNode], allowed: &[TypeName]) -> Result<()> {
        if !self.ctx.strict() {
            return Ok(());
        }
        for arg in args {
            let t = arg.type_name(self.ctx.catalog);
            if is_vague(t) || allowed.contains(&t) {
                continue;
            }
            let expected = allowed.iter().map(|t| t.as_str()).collect::<Vec<_>>().join("|");
            return Err(CompileError::invalid(
                format!(
                    "\"{}\" expression expected input to be \"{}\" but got \"{}\"",
                    key,
                    expected,
                    t.as_str()
                ),
                path,
            ));
        }
        Ok(())
    }

    fn expect_arrays(&self, key: &str, path: &str, args: &[ProjectedNode], expecting: bool) -> Result<()> {
        if !self.ctx.strict() {
            return Ok(());
        }
        if args.iter().any(|arg| arg.is_array(self.ctx.catalog) == Some(!expecting)) {
            let which = if expecting { "is" } else { "is not" };
            return Err(CompileError::invalid(
                format!("\"{}\" expression {} expecting an array.", key, which),
                path,
            ));
        }
        Ok(())
    }

    fn add_output(&self, args: &[ProjectedNode], path: &str) -> Result<ProjectedNode> {
        let types: Vec<TypeName> = args.iter().map(|a| a.type_name(self.ctx.catalog)).collect();
        let dates = types.iter().filter(|t| **t == TypeName::Date).count();
        if dates > 1 {
            return Err(CompileError::invalid("$add expression only supports a single date value.", path));
        }
        if let Some(other) = types
            .iter()
            .find(|t| !is_vague(**t) && !matches!(t, TypeName::Number | TypeName::Date))
        {
            return Err(CompileError::invalid(
                format!("$add expected a Number or Date but got a \"{}\"", other.as_str()),
                path,
            ));
        }
        Ok(scalar(if dates == 1 { TypeName::Date } else { TypeName::Number }))
    }

    fn subtract_output(&self, args: &[ProjectedNode], path: &str) -> Result<ProjectedNode> {
        let type_at = |i: usize| args.get(i).map_or(TypeName::Unknown, |a| a.type_name(self.ctx.catalog));
        let (a, b) = (type_at(0), type_at(1));
        let output = match (a, b) {
            (TypeName::Date, TypeName::Date) | (TypeName::Number, TypeName::Number) => TypeName::Number,
            (TypeName::Date, TypeName::Number) => TypeName::Date,
            (TypeName::Date, other) if is_vague(other) => TypeName::Date,
            (x, y) if is_vague(x) || is_vague(y) => TypeName::Number,
            (x, y) => {
                return Err(CompileError::invalid(
                    format!(
                        "$subtract expects Date/Date, Number/Number or Date/Number but got \"{}/{}\"",
                        x.as_str(),
                        y.as_str()
                    ),
                    path,
                ))
            }
        };
        Ok(scalar(output))
    }
}
