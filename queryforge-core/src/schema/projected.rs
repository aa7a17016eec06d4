// queryforge-core/src/schema/projected.rs
// Nodes synthesized by $project, $addFields and $group

use super::{AccessLevel, Catalog, NodeId, TypeName};

/// Where a projected node's data comes from
#[derive(Debug, Clone)]
pub enum ProjectedSource {
    Node(NodeId),
    Projected(Box<ProjectedNode>),
}

/// A typed output node produced while validating a projection stage.
///
/// Type and array-ness may be left unset and are then derived from the
/// sources; `properties` holds the children of a projected document.
#[derive(Debug, Clone)]
pub struct ProjectedNode {
    pub name: String,
    pub type_name: Option<TypeName>,
    pub array: Option<bool>,
    pub read_access: AccessLevel,
    pub sources: Vec<ProjectedSource>,
    pub properties: Vec<ProjectedNode>,
    pub document: bool,
}

impl ProjectedNode {
    pub fn new(name: impl Into<String>) -> Self {
        ProjectedNode {
            name: name.into(),
            type_name: None,
            array: None,
            read_access: AccessLevel::None,
            sources: Vec::new(),
            properties: Vec::new(),
            document: false,
        }
    }

    pub fn typed(mut self, type_name: TypeName) -> Self {
        self.type_name = Some(type_name);
        self
    }

    pub fn with_array(mut self, array: Option<bool>) -> Self {
        self.array = array;
        self
    }

    pub fn with_sources(mut self, sources: Vec<ProjectedSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn bump_read_access(&mut self, level: AccessLevel) {
        if level > self.read_access {
            self.read_access = level;
        }
    }

    /// A projected sub-document built from `properties`
    pub fn document(mut self, properties: Vec<ProjectedNode>) -> Self {
        self.document = true;
        self.properties = properties;
        self
    }

    /// Explicit type, or the single type every source agrees on
    pub fn type_name(&self, catalog: &Catalog<'_>) -> TypeName {
        if let Some(type_name) = self.type_name {
            return type_name;
        }
        if self.document {
            return TypeName::Document;
        }
        self.source_type_name(catalog).unwrap_or(TypeName::Unknown)
    }

    /// Type the sources agree on, ignoring any explicit type. Several
    /// documents or references never agree since their shapes may differ.
    pub fn source_type_name(&self, catalog: &Catalog<'_>) -> Option<TypeName> {
        let mut found: Option<TypeName> = None;
        for source in &self.sources {
            let t = match source {
                ProjectedSource::Node(id) => catalog.node(*id).type_name,
                ProjectedSource::Projected(node) => node.type_name(catalog),
            };
            match found {
                None => found = Some(t),
                Some(current) => {
                    if current != t || matches!(current, TypeName::Document | TypeName::Reference) {
                        return Some(TypeName::Unknown);
                    }
                }
            }
        }
        found
    }

    /// Paths the concrete sources need selected alongside them
    pub fn dependencies(&self, catalog: &Catalog<'_>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in self.concrete_sources(catalog) {
            for dep in &catalog.node(id).dependencies {
                if !out.contains(dep) {
                    out.push(dep.clone());
                }
            }
        }
        for child in &self.properties {
            for dep in child.dependencies(catalog) {
                if !out.contains(&dep) {
                    out.push(dep);
                }
            }
        }
        out
    }

    /// Explicit array-ness, or whatever every source agrees on
    pub fn is_array(&self, catalog: &Catalog<'_>) -> Option<bool> {
        if self.array.is_some() {
            return self.array;
        }
        let mut arrays = self.sources.iter().map(|source| match source {
            ProjectedSource::Node(id) => Some(catalog.node(*id).array),
            ProjectedSource::Projected(node) => node.is_array(catalog),
        });
        match arrays.next() {
            Some(first) if arrays.all(|a| a == first) => first,
            _ => None,
        }
    }

    pub fn public_type_name(&self, catalog: &Catalog<'_>) -> String {
        self.type_name(catalog)
            .public_name(self.is_array(catalog).unwrap_or(false))
    }

    /// Concrete schema nodes, however deeply nested the sources are
    pub fn concrete_sources(&self, catalog: &Catalog<'_>) -> Vec<NodeId> {
        let mut out = Vec::new();
        for source in &self.sources {
            match source {
                ProjectedSource::Node(id) => {
                    let node = catalog.node(*id);
                    if node.projected && !node.sources.is_empty() {
                        out.extend(node.sources.iter().copied());
                    } else {
                        out.push(*id);
                    }
                }
                ProjectedSource::Projected(node) => out.extend(node.concrete_sources(catalog)),
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Source nodes not backed by concrete data
    pub fn reader_sources(&self, catalog: &Catalog<'_>) -> Vec<NodeId> {
        let mut out = Vec::new();
        for source in &self.sources {
            match source {
                ProjectedSource::Node(id) => {
                    if catalog.node(*id).is_reader_backed() {
                        out.push(*id);
                    }
                }
                ProjectedSource::Projected(node) => out.extend(node.reader_sources(catalog)),
            }
        }
        out
    }

    pub fn has_reader(&self, catalog: &Catalog<'_>) -> bool {
        !self.reader_sources(catalog).is_empty()
    }

    pub fn is_expandable(&self, catalog: &Catalog<'_>) -> bool {
        let sources = self.concrete_sources(catalog);
        !sources.is_empty() && sources.iter().all(|id| catalog.node(*id).expandable)
    }

    /// Highest read access of this node and its sources
    pub fn effective_read_access(&self, catalog: &Catalog<'_>) -> AccessLevel {
        self.sources
            .iter()
            .map(|source| match source {
                ProjectedSource::Node(id) => catalog.node(*id).read_access,
                ProjectedSource::Projected(node) => node.effective_read_access(catalog),
            })
            .fold(self.read_access, |acc, level| acc.max(level))
    }
}
