// queryforge-core/src/stage/mod.rs
//! Per-stage compilers
//!
//! Every stage runs the same cycle against its own `Tree`:
//!
//! ```text
//! normalize (string shorthands, JSON strings)
//!     ↓
//! parse      → Tree (structural rules, operator tables)
//!     ↓
//! resolve    → candidate models / properties (memoized per component)
//!     ↓
//! validate   → schema, acl and index checks
//!     ↓
//! build      → native stage JSON (+ index entries, post-checks)
//! ```
//!
//! Stages share a read-only `StageContext` carrying what the previous stage
//! produced. Nothing in a stage outlives one compile.

pub mod expression;
pub mod group;
pub mod matching;
pub mod project;
pub mod scalar;
pub mod sort;
#[cfg(test)]
pub(crate) mod testing;
pub mod unwind;

use crate::error::{CompileError, Result};
use crate::limits::{exceeds, variable_name, Limits};
use crate::options::CompilerOptions;
use crate::property::CandidateProperty;
use crate::schema::{
    AccessLevel, AccessPolicy, Catalog, IndexCatalog, ModelId, NodeAcl, NodeId, ProjectedNode,
    TypeName,
};
use crate::tree::{ComponentId, RValue, Tree, ValueId};
use crate::{log_debug, log_trace};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::Cell;

// ============================================================================
// STAGE KINDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageKind {
    Match,
    Sort,
    Group,
    Project,
    AddFields,
    Limit,
    Skip,
    Unwind,
}

impl StageKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$match" => Some(StageKind::Match),
            "$sort" => Some(StageKind::Sort),
            "$group" => Some(StageKind::Group),
            "$project" => Some(StageKind::Project),
            "$addFields" => Some(StageKind::AddFields),
            "$limit" => Some(StageKind::Limit),
            "$skip" => Some(StageKind::Skip),
            "$unwind" => Some(StageKind::Unwind),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            StageKind::Match => "$match",
            StageKind::Sort => "$sort",
            StageKind::Group => "$group",
            StageKind::Project => "$project",
            StageKind::AddFields => "$addFields",
            StageKind::Limit => "$limit",
            StageKind::Skip => "$skip",
            StageKind::Unwind => "$unwind",
        }
    }

    /// May contribute to native index selection
    pub fn indexable(&self) -> bool {
        matches!(self, StageKind::Match | StageKind::Sort)
    }

    /// Runs as a plain find (query + sort + skip + limit)
    pub fn is_query_compatible(&self) -> bool {
        matches!(
            self,
            StageKind::Match | StageKind::Sort | StageKind::Limit | StageKind::Skip
        )
    }

    /// Replaces the document shape for later stages
    pub fn is_projection(&self) -> bool {
        matches!(self, StageKind::Group | StageKind::Project | StageKind::AddFields)
    }
}

// ============================================================================
// STAGE CONTEXT
// ============================================================================

/// Read-only inputs of one stage compile
pub struct StageContext<'c, 's> {
    pub catalog: &'c Catalog<'s>,
    pub options: &'c CompilerOptions,
    pub limits: Limits,
    pub policy: &'c dyn AccessPolicy,
    pub indexes: &'c dyn IndexCatalog,
    pub kind: StageKind,
    /// Zero-based position in the pipeline
    pub position: usize,
    /// Models leaving the previous stage, or every model of the object
    pub input_models: Vec<ModelId>,
    /// Properties narrowed by the previous stage
    pub input_properties: Vec<CandidateProperty>,
    /// Every stage so far is a match or sort
    pub uses_index: bool,
    pub skip_acl: bool,
    pub later_stages: Vec<StageKind>,
    /// Keys used by earlier index-eligible stages
    pub prior_index_keys: Vec<String>,
    pub required_access: Cell<AccessLevel>,
}

impl<'c, 's> StageContext<'c, 's> {
    pub fn new(
        catalog: &'c Catalog<'s>,
        options: &'c CompilerOptions,
        policy: &'c dyn AccessPolicy,
        indexes: &'c dyn IndexCatalog,
        kind: StageKind,
    ) -> Self {
        StageContext {
            catalog,
            options,
            limits: options.limits(),
            policy,
            indexes,
            kind,
            position: 0,
            input_models: Vec::new(),
            input_properties: Vec::new(),
            uses_index: false,
            skip_acl: false,
            later_stages: Vec::new(),
            prior_index_keys: Vec::new(),
            required_access: Cell::new(AccessLevel::None),
        }
    }

    pub fn strict(&self) -> bool {
        self.options.strict
    }

    /// Base-find seed; empty once the pipeline stops being index eligible
    pub fn base_find(&self) -> Map<String, Value> {
        if self.uses_index {
            self.options.base_find.clone()
        } else {
            Map::new()
        }
    }

    /// Name of a `{{variable}}` placeholder in variable mode
    pub fn variable(&self, value: &Value) -> Option<String> {
        if !self.options.with_variables {
            return None;
        }
        value.as_str().and_then(variable_name).map(str::to_string)
    }

    pub fn bump_access(&self, level: AccessLevel) {
        if level > self.required_access.get() {
            log_debug!(
                "{} stage {} raised required access to {}",
                self.kind.key(),
                self.position,
                level.as_str()
            );
            self.required_access.set(level);
        }
    }

    /// Authorize reading `node` for this stage.
    ///
    /// Nodes without their own acl entries raise the pipeline-wide access
    /// level when `bump` is set, since matching or sorting on a value leaks
    /// it even when the value itself is never returned.
    pub fn authorize(&self, node: NodeId, bump: bool) -> Result<()> {
        let n = self.catalog.node(node);
        if !n.readable {
            return Err(CompileError::not_found("Property not found.", n.fullpath.clone()));
        }
        if !self.skip_acl && n.type_name != TypeName::List {
            match n.acl {
                Some(NodeAcl::NonTargeted) => {
                    return Err(CompileError::unsupported(
                        "Operation is not available for properties with custom non-targeted acl entries.",
                        n.fullpath.clone(),
                    ));
                }
                Some(NodeAcl::Targeted(level)) => {
                    self.policy.authorize(self.catalog.node_model(node), n, level)?;
                }
                None => {
                    if bump {
                        self.bump_access(n.read_access);
                    }
                }
            }
        }
        if !self.options.allow_system_access && n.read_access == AccessLevel::System {
            return Err(CompileError::not_found("Property not found.", n.fullpath.clone()));
        }
        log_trace!("authorized {} in {} stage {}", n.fqpp, self.kind.key(), self.position);
        Ok(())
    }

    /// The native index tree of the target collection
    pub fn index_tree(&self) -> crate::schema::IndexTree {
        crate::schema::IndexTree::from_indexes(&self.indexes.collection_indexes(&self.options.collection))
    }

    /// Fail when `kind` appears after this stage
    pub fn later_stage_of(&self, kinds: &[StageKind]) -> Option<(StageKind, usize)> {
        self.later_stages
            .iter()
            .enumerate()
            .find(|(_, k)| kinds.contains(k))
            .map(|(i, k)| (*k, self.position + i + 1))
    }
}

// ============================================================================
// STAGE OUTPUT
// ============================================================================

/// A `$expand` request recorded for the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expansion {
    pub path: String,
    pub arguments: Value,
}

/// Output shape of a projecting stage
#[derive(Debug, Clone)]
pub struct Projection {
    pub nodes: Vec<ProjectedNode>,
    /// `$addFields`: paths not produced here still resolve against the input
    pub extends_input: bool,
}

/// What one compiled stage hands to the pipeline
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub json: Value,
    pub models: Vec<ModelId>,
    pub properties: Vec<CandidateProperty>,
    pub projection: Option<Projection>,
    pub variables: Vec<String>,
    pub expansions: Vec<Expansion>,
    /// Query keys later index checks may rely on
    pub index_keys: Vec<String>,
}

impl StageOutput {
    pub fn passthrough(json: Value, ctx: &StageContext<'_, '_>) -> Self {
        StageOutput {
            json,
            models: ctx.input_models.clone(),
            properties: ctx.input_properties.clone(),
            projection: None,
            variables: Vec::new(),
            expansions: Vec::new(),
            index_keys: Vec::new(),
        }
    }
}

/// Compile one stage value
pub fn compile_stage(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    log_debug!("compiling {} stage {}", ctx.kind.key(), ctx.position);
    match ctx.kind {
        StageKind::Match => matching::compile(value, ctx),
        StageKind::Sort => sort::compile(value, ctx),
        StageKind::Group => group::compile(value, ctx),
        StageKind::Project | StageKind::AddFields => project::compile(value, ctx),
        StageKind::Unwind => unwind::compile(value, ctx),
        StageKind::Limit | StageKind::Skip => scalar::compile(value, ctx),
    }
}

// ============================================================================
// SHARED PARSING HELPERS
// ============================================================================

/// Stage value normalization: JSON strings are parsed, then an object is required
pub fn normalize_stage_value(kind: StageKind, value: &Value) -> Result<Map<String, Value>> {
    let parsed = match value {
        Value::String(s) => serde_json::from_str::<Value>(s).map_err(|_| {
            CompileError::invalid(format!("Invalid {} JSON format", kind.key()), "")
        })?,
        other => other.clone(),
    };
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(CompileError::invalid(
            format!("Object expected for {} expression", kind.key()),
            "",
        )),
    }
}

/// A plain shorthand name such as `c_name`
pub fn is_shorthand_name(value: &str, allow_dots: bool) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_dots && c == '.'))
}

/// Structural checks shared by every expression value about to be parsed
/// under `owner`. Returns the object.
pub fn check_expression<'v>(
    tree: &Tree,
    owner: ComponentId,
    value: &'v Value,
    limits: &Limits,
) -> Result<&'v Map<String, Value>> {
    let path = &tree.component(owner).fullpath;
    if exceeds(limits.max_expression_depth, tree.depth_for(owner)) {
        return Err(CompileError::invalid(
            format!(
                "Maximum query depth ({}) exceeded",
                crate::limits::MAX_EXPRESSION_DEPTH
            ),
            path.clone(),
        ));
    }
    let map = value
        .as_object()
        .ok_or_else(|| CompileError::invalid("Object expected for expression", path.clone()))?;
    if map.is_empty() {
        return Err(CompileError::invalid(
            "expression requires at least one field or operator",
            path.clone(),
        ));
    }
    if exceeds(limits.max_expression_keys, map.len()) {
        return Err(CompileError::invalid(
            format!(
                "Maximum expression keys ({}) exceeded",
                crate::limits::MAX_EXPRESSION_KEYS
            ),
            path.clone(),
        ));
    }
    Ok(map)
}

/// Start a tree whose root holds an (empty, to be filled) expression
pub fn new_rooted_tree(kind: StageKind) -> (Tree, ValueId) {
    let mut tree = Tree::new(kind.key());
    let root = tree.root();
    let value = tree.add_value(root, RValue::Expression(Vec::new()));
    tree.set_component_value(root, value);
    (tree, value)
}

/// Where a value being parsed will live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The value of a component
    Value(ComponentId),
    /// An element of an array value
    Element(ValueId, usize),
}

impl Slot {
    pub fn owner(&self, tree: &Tree) -> ComponentId {
        match self {
            Slot::Value(component) => *component,
            Slot::Element(array, _) => tree.value(*array).component,
        }
    }

    /// Add `rvalue` to the tree and link it into this slot
    pub fn place(&self, tree: &mut Tree, rvalue: RValue) -> ValueId {
        match self {
            Slot::Value(component) => {
                let id = tree.add_value(*component, rvalue);
                tree.set_component_value(*component, id);
                id
            }
            Slot::Element(array, position) => {
                let id = tree.add_element(*array, *position, rvalue);
                tree.push_element(*array, id);
                id
            }
        }
    }
}

/// Nodes a path resolves to for projection-style lookups: an existing
/// candidate property wins, otherwise every input model is searched
pub fn gather_candidate_nodes(ctx: &StageContext<'_, '_>, path: &str) -> (Vec<NodeId>, Option<bool>) {
    match crate::property::find_property(&ctx.input_properties, path) {
        Some(property) => (property.nodes.clone(), property.is_array),
        None => (ctx.catalog.gather_nodes(&ctx.input_models, path), None),
    }
}

/// False when `node` lives in a set document that an already narrowed
/// discriminator property excludes. Discriminator nodes themselves pass.
pub fn discriminator_allows(catalog: &Catalog<'_>, properties: &[CandidateProperty], node: NodeId) -> bool {
    let key = match catalog.discriminator_key(node) {
        Some(key) => key,
        None => return true,
    };
    if catalog.node(node).name == key {
        return true;
    }
    let set_path = catalog
        .path_parent(node)
        .map(|set| catalog.node(set).fullpath.clone())
        .unwrap_or_default();
    let discriminator_path = format!("{}.{}", set_path, key);
    match crate::property::find_property(properties, &discriminator_path) {
        None => true,
        Some(property) => {
            let names: Vec<&str> = property
                .nodes
                .iter()
                .filter_map(|n| catalog.document_name(*n))
                .collect();
            catalog
                .document_name(node)
                .map_or(true, |name| names.contains(&name))
        }
    }
}

/// Drop nodes excluded by the input's narrowed discriminators
pub fn filter_by_discriminators(ctx: &StageContext<'_, '_>, nodes: Vec<NodeId>) -> Vec<NodeId> {
    nodes
        .into_iter()
        .filter(|node| discriminator_allows(ctx.catalog, &ctx.input_properties, *node))
        .collect()
}

/// Error for a strict lookup that found nothing
pub fn no_candidates(what: &str, path: &str, fullpath: &str) -> CompileError {
    CompileError::invalid(
        format!("strict: there are no properties that could {} {}", what, path),
        fullpath,
    )
}
