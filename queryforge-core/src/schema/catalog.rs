// queryforge-core/src/schema/catalog.rs
// Per-compile view over the schema plus projected models

use super::{Model, ModelId, NodeId, ProjectedNode, Schema, SchemaNode, TypeName};
use crate::error::Result;

/// The loaded schema, extended with the models synthesized by `$project`,
/// `$group` and `$addFields` while one pipeline compiles.
///
/// Overlay ids continue after the schema's own ids, so a `NodeId` or
/// `ModelId` handed out by either side stays valid for the whole compile.
#[derive(Debug)]
pub struct Catalog<'s> {
    schema: &'s Schema,
    nodes: Vec<SchemaNode>,
    models: Vec<Model>,
}

impl<'s> Catalog<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Catalog {
            schema,
            nodes: Vec::new(),
            models: Vec::new(),
        }
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    pub fn node(&self, id: NodeId) -> &SchemaNode {
        let base = self.schema.nodes.len();
        if id.0 < base {
            &self.schema.nodes[id.0]
        } else {
            &self.nodes[id.0 - base]
        }
    }

    pub fn model(&self, id: ModelId) -> &Model {
        let base = self.schema.models.len();
        if id.0 < base {
            &self.schema.models[id.0]
        } else {
            &self.models[id.0 - base]
        }
    }

    /// Model a node belongs to
    pub fn node_model(&self, id: NodeId) -> &Model {
        self.model(self.node(id).model)
    }

    pub fn object_models(&self, object: &str) -> Result<Vec<ModelId>> {
        self.schema.object_models(object).map(|models| models.to_vec())
    }

    fn is_root(&self, id: NodeId) -> bool {
        self.node(id).parent.is_none()
    }

    /// Parent in path terms: set documents are skipped
    pub fn path_parent(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.node(id).parent?;
        if self.is_set_document(parent) {
            self.node(parent).parent
        } else {
            Some(parent)
        }
    }

    /// A document definition living inside a set
    pub fn is_set_document(&self, id: NodeId) -> bool {
        self.node(id)
            .parent
            .map_or(false, |parent| self.node(parent).type_name == TypeName::Set)
    }

    /// Discriminator key of the set a node lives in, if any
    pub fn discriminator_key(&self, id: NodeId) -> Option<&str> {
        self.path_parent(id)
            .and_then(|parent| self.node(parent).discriminator_key.as_deref())
    }

    /// Name of the set document a node is defined in
    pub fn document_name(&self, id: NodeId) -> Option<&str> {
        let parent = self.node(id).parent?;
        if self.is_set_document(parent) {
            Some(self.node(parent).name.as_str())
        } else {
            None
        }
    }

    /// The node itself and every ancestor below the model root
    pub fn lineage(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if self.is_root(node) {
                break;
            }
            out.push(node);
            current = self.node(node).parent;
        }
        out
    }

    /// Children addressable by name; set documents are transparent
    fn path_children(&self, id: NodeId) -> Vec<NodeId> {
        let node = self.node(id);
        if node.type_name == TypeName::Set {
            node.children
                .iter()
                .flat_map(|doc| self.node(*doc).children.iter().copied())
                .collect()
        } else {
            node.children.clone()
        }
    }

    /// Resolve a dotted path inside one model.
    ///
    /// An `Any` node swallows the rest of the path. Projected models that
    /// extend others fall back to them for paths they do not define.
    pub fn find_nodes(&self, model: ModelId, path: &str) -> Vec<NodeId> {
        let m = self.model(model);
        let mut current = vec![m.root];
        for segment in path.split('.') {
            let mut next = Vec::new();
            for id in &current {
                if !self.is_root(*id) && self.node(*id).type_name == TypeName::Any {
                    next.push(*id);
                    continue;
                }
                for child in self.path_children(*id) {
                    if self.node(child).name == segment && !next.contains(&child) {
                        next.push(child);
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        if current.is_empty() {
            for base in &m.base {
                for id in self.find_nodes(*base, path) {
                    if !current.contains(&id) {
                        current.push(id);
                    }
                }
            }
        }
        current
    }

    /// Resolve a path across models, keeping one node per fully qualified
    /// path. Typed variants win over their type master.
    pub fn gather_nodes(&self, models: &[ModelId], path: &str) -> Vec<NodeId> {
        let mut found: Vec<NodeId> = Vec::new();
        for model in models {
            for id in self.find_nodes(*model, path) {
                let fqpp = &self.node(id).fqpp;
                match found.iter().position(|existing| &self.node(*existing).fqpp == fqpp) {
                    None => found.push(id),
                    Some(pos) => {
                        let current = self.node_model(found[pos]);
                        if current.type_master && self.node_model(id).is_typed_variant() {
                            found[pos] = id;
                        }
                    }
                }
            }
        }
        found
    }

    /// The type every model in `models` belongs to, if they agree
    pub fn agreed_type_name(&self, models: &[ModelId]) -> Option<String> {
        let mut names = models.iter().map(|id| self.model(*id).type_name.as_deref());
        let first = names.next()??;
        names.all(|name| name == Some(first)).then(|| first.to_string())
    }

    /// Register the output shape of a projecting stage as a new model
    pub fn add_projected_model(
        &mut self,
        object_name: &str,
        type_name: Option<String>,
        properties: &[ProjectedNode],
        base: Vec<ModelId>,
    ) -> ModelId {
        let model_id = ModelId(self.schema.models.len() + self.models.len());
        let root = self.next_node_id();
        let mut root_node = SchemaNode::new(root, model_id, "", TypeName::Document);
        root_node.projected = true;
        root_node.fqpp = format!("{}${}", object_name, model_id.0);
        let prefix = root_node.fqpp.clone();
        self.nodes.push(root_node);

        for property in properties {
            let child = self.push_projected(model_id, root, "", &prefix, property);
            self.overlay_node_mut(root).children.push(child);
        }

        self.models.push(Model {
            id: model_id,
            object_name: object_name.to_string(),
            type_name,
            type_master: false,
            root,
            base,
            projected: true,
        });
        model_id
    }

    fn next_node_id(&self) -> NodeId {
        NodeId(self.schema.nodes.len() + self.nodes.len())
    }

    fn overlay_node_mut(&mut self, id: NodeId) -> &mut SchemaNode {
        let base = self.schema.nodes.len();
        &mut self.nodes[id.0 - base]
    }

    fn push_projected(
        &mut self,
        model: ModelId,
        parent: NodeId,
        parent_path: &str,
        parent_fqpp: &str,
        property: &ProjectedNode,
    ) -> NodeId {
        let id = self.next_node_id();
        let mut node = SchemaNode::new(id, model, &property.name, property.type_name(self));
        node.fullpath = if parent_path.is_empty() {
            property.name.clone()
        } else {
            format!("{}.{}", parent_path, property.name)
        };
        node.fqpp = format!("{}.{}", parent_fqpp, property.name);
        node.parent = Some(parent);
        node.array = property.is_array(self).unwrap_or(false);
        node.sources = property.concrete_sources(self);
        node.reader = property.has_reader(self);
        node.read_access = property.effective_read_access(self);
        node.expandable = property.is_expandable(self);
        node.localized = !node.sources.is_empty()
            && node.sources.iter().all(|source| self.node(*source).localized);
        node.projected = true;

        let path = node.fullpath.clone();
        let fqpp = node.fqpp.clone();
        self.nodes.push(node);

        for child in &property.properties {
            let child_id = self.push_projected(model, id, &path, &fqpp, child);
            self.overlay_node_mut(id).children.push(child_id);
        }
        id
    }
}
