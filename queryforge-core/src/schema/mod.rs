// queryforge-core/src/schema/mod.rs
//! Schema metadata consumed by the compiler
//!
//! The compiler never defines the schema language; it only asks narrow
//! questions of it: which nodes a path resolves to, what type a node has,
//! how a literal is cast for a query, whether the principal may read a node
//! and which native indexes exist. This module holds the node/model data
//! those questions are answered from, plus a JSON loader for it.
//!
//! ```text
//! Schema (loaded once, shared read-only)
//!     ↓
//! Catalog (per compile: Schema + models projected by $project/$group/$addFields)
//!     ↓
//! AccessPolicy / IndexCatalog (authorization + native index introspection)
//! ```

mod acl;
mod cast;
mod catalog;
mod indexes;
mod loader;
mod projected;

pub use acl::{AccessLevel, AccessPolicy, AllowAll, NodeAcl, PrincipalAccess};
pub use cast::{cast_for_query, date_value, is_object_id, object_id_hex, parse_date};
pub use catalog::Catalog;
pub use indexes::{IndexCatalog, IndexDefinition, IndexTree};
pub use projected::{ProjectedNode, ProjectedSource};

use crate::error::{CompileError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub usize);

/// Property type names as the schema reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeName {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Reference,
    Geometry,
    Any,
    Document,
    Set,
    List,
    Unknown,
}

impl TypeName {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "String" => Some(Self::String),
            "Number" => Some(Self::Number),
            "Boolean" => Some(Self::Boolean),
            "Date" => Some(Self::Date),
            "ObjectId" => Some(Self::ObjectId),
            "Reference" => Some(Self::Reference),
            "Geometry" => Some(Self::Geometry),
            "Any" => Some(Self::Any),
            "Document" => Some(Self::Document),
            "Set" => Some(Self::Set),
            "List" => Some(Self::List),
            "Unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeName::String => "String",
            TypeName::Number => "Number",
            TypeName::Boolean => "Boolean",
            TypeName::Date => "Date",
            TypeName::ObjectId => "ObjectId",
            TypeName::Reference => "Reference",
            TypeName::Geometry => "Geometry",
            TypeName::Any => "Any",
            TypeName::Document => "Document",
            TypeName::Set => "Set",
            TypeName::List => "List",
            TypeName::Unknown => "Unknown",
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TypeName::String | TypeName::Number | TypeName::Boolean | TypeName::Date | TypeName::ObjectId
        )
    }

    /// `String`, `Reference[]`, ...
    pub fn public_name(&self, array: bool) -> String {
        if array {
            format!("{}[]", self.as_str())
        } else {
            self.as_str().to_string()
        }
    }
}

/// One property definition inside a model's schema tree
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub id: NodeId,
    pub model: ModelId,
    pub name: String,
    /// Path inside the model; set documents do not contribute a segment
    pub fullpath: String,
    /// Fully qualified property path, unique per definition
    pub fqpp: String,
    pub type_name: TypeName,
    pub array: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub readable: bool,
    pub read_access: AccessLevel,
    pub acl: Option<NodeAcl>,
    pub is_virtual: bool,
    pub reader: bool,
    pub group_reader: bool,
    pub indexed: bool,
    /// Custom index slot (`u1`, `i3`, `g2` ...)
    pub slot: Option<String>,
    pub native_index: bool,
    pub localized: bool,
    pub fixed_locale: Option<String>,
    pub expandable: bool,
    pub dependencies: Vec<String>,
    /// Set nodes only
    pub discriminator_key: Option<String>,
    /// Projected nodes: the concrete nodes they were derived from
    pub sources: Vec<NodeId>,
    pub projected: bool,
    /// Type that declares the property, when it is not shared by every type
    pub declared_type: Option<String>,
}

impl SchemaNode {
    pub(crate) fn new(id: NodeId, model: ModelId, name: &str, type_name: TypeName) -> Self {
        SchemaNode {
            id,
            model,
            name: name.to_string(),
            fullpath: String::new(),
            fqpp: String::new(),
            type_name,
            array: false,
            parent: None,
            children: Vec::new(),
            readable: true,
            read_access: AccessLevel::Read,
            acl: None,
            is_virtual: false,
            reader: false,
            group_reader: false,
            indexed: false,
            slot: None,
            native_index: false,
            localized: false,
            fixed_locale: None,
            expandable: false,
            dependencies: Vec::new(),
            discriminator_key: None,
            sources: Vec::new(),
            projected: false,
            declared_type: None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        self.type_name.is_primitive()
    }

    pub fn public_type_name(&self) -> String {
        self.type_name.public_name(self.array)
    }

    /// Backed by a custom reader, a group reader or no data at all
    pub fn is_reader_backed(&self) -> bool {
        self.reader || self.group_reader || self.is_virtual
    }
}

/// One polymorphic variant (object or object#type) of the documents
#[derive(Debug, Clone)]
pub struct Model {
    pub id: ModelId,
    pub object_name: String,
    /// Set on typed variants
    pub type_name: Option<String>,
    /// The object declares types and this is its untyped master
    pub type_master: bool,
    pub root: NodeId,
    /// `$addFields` output falls back to these for undefined paths
    pub base: Vec<ModelId>,
    pub projected: bool,
}

impl Model {
    /// A typed variant of a typed object
    pub fn is_typed_variant(&self) -> bool {
        self.type_name.is_some()
    }

    pub fn is_typed(&self) -> bool {
        self.type_master || self.type_name.is_some()
    }

    pub fn qualified_name(&self) -> String {
        match &self.type_name {
            Some(type_name) => format!("{}#{}", self.object_name, type_name),
            None => self.object_name.clone(),
        }
    }
}

/// Loaded schema: every object's models and their node trees
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub(crate) nodes: Vec<SchemaNode>,
    pub(crate) models: Vec<Model>,
    pub(crate) objects: HashMap<String, Vec<ModelId>>,
    pub(crate) indexes: HashMap<String, Vec<IndexDefinition>>,
}

impl Schema {
    /// Load from the JSON schema document format
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        loader::load(value)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    pub fn node(&self, id: NodeId) -> Option<&SchemaNode> {
        self.nodes.get(id.0)
    }

    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.get(id.0)
    }

    /// Models of an object: the master (or only) model first, then typed variants
    pub fn object_models(&self, object: &str) -> Result<&[ModelId]> {
        self.objects
            .get(object)
            .map(|models| models.as_slice())
            .ok_or_else(|| CompileError::not_found(format!("Object not found: {}", object), ""))
    }

    pub fn object_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.objects.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl IndexCatalog for Schema {
    fn collection_indexes(&self, collection: &str) -> Vec<IndexDefinition> {
        self.indexes.get(collection).cloned().unwrap_or_default()
    }
}
