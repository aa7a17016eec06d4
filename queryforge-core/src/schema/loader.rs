// queryforge-core/src/schema/loader.rs
// JSON schema document -> Schema

use super::{
    AccessLevel, IndexDefinition, Model, ModelId, NodeAcl, NodeId, Schema, SchemaNode, TypeName,
};
use crate::error::{CompileError, Result};
use crate::limits::FIELD_NAME_REGEX;
use crate::log_debug;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

lazy_static! {
    static ref SLOT_REGEX: Regex = Regex::new(r"^[a-z][0-9]{1,3}$").unwrap();
}

const DEFAULT_DISCRIMINATOR: &str = "name";

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    objects: Vec<ObjectDef>,
    #[serde(default)]
    indexes: HashMap<String, Vec<IndexDefinition>>,
}

#[derive(Debug, Deserialize)]
struct ObjectDef {
    name: String,
    #[serde(default)]
    properties: Vec<PropertyDef>,
    #[serde(default)]
    types: Vec<TypeDef>,
}

#[derive(Debug, Deserialize)]
struct TypeDef {
    name: String,
    #[serde(default)]
    properties: Vec<PropertyDef>,
}

#[derive(Debug, Clone, Deserialize)]
struct DocumentDef {
    name: String,
    #[serde(default)]
    properties: Vec<PropertyDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyDef {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    array: bool,
    #[serde(default)]
    indexed: bool,
    #[serde(default)]
    slot: Option<String>,
    #[serde(default)]
    native_index: bool,
    #[serde(default)]
    localized: bool,
    #[serde(default)]
    fixed_locale: Option<String>,
    #[serde(default, rename = "virtual")]
    is_virtual: bool,
    #[serde(default)]
    reader: bool,
    #[serde(default)]
    group_reader: bool,
    #[serde(default)]
    readable: Option<bool>,
    #[serde(default)]
    read_access: Option<AccessLevel>,
    #[serde(default)]
    acl: Option<NodeAcl>,
    #[serde(default)]
    expandable: bool,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    properties: Vec<PropertyDef>,
    #[serde(default)]
    documents: Vec<DocumentDef>,
    #[serde(default)]
    discriminator_key: Option<String>,
}

impl PropertyDef {
    fn builtin(name: &str, type_name: TypeName) -> Self {
        PropertyDef {
            name: name.to_string(),
            type_name: type_name.as_str().to_string(),
            array: false,
            indexed: false,
            slot: None,
            native_index: true,
            localized: false,
            fixed_locale: None,
            is_virtual: false,
            reader: false,
            group_reader: false,
            readable: None,
            read_access: None,
            acl: None,
            expandable: false,
            dependencies: Vec::new(),
            properties: Vec::new(),
            documents: Vec::new(),
            discriminator_key: None,
        }
    }

    fn discriminator(name: &str) -> Self {
        PropertyDef {
            native_index: false,
            ..PropertyDef::builtin(name, TypeName::String)
        }
    }
}

const BUILTIN_NAMES: [&str; 4] = ["_id", "object", "type", "created"];

fn builtins(typed: bool) -> Vec<PropertyDef> {
    let mut props = vec![
        PropertyDef::builtin("_id", TypeName::ObjectId),
        PropertyDef::builtin("object", TypeName::String),
    ];
    if typed {
        props.push(PropertyDef::builtin("type", TypeName::String));
    }
    props.push(PropertyDef::builtin("created", TypeName::Date));
    props
}

/// Build a `Schema` from its JSON document form
pub(crate) fn load(value: &Value) -> Result<Schema> {
    let document: SchemaDocument = serde_json::from_value(value.clone())
        .map_err(|e| CompileError::Schema(format!("Invalid schema document: {}", e)))?;

    let mut builder = SchemaBuilder::default();
    for object in &document.objects {
        builder.add_object(object)?;
    }
    builder.schema.indexes = document.indexes;

    log_debug!(
        "Loaded schema with {} objects, {} models and {} nodes",
        builder.schema.objects.len(),
        builder.schema.models.len(),
        builder.schema.nodes.len()
    );
    Ok(builder.schema)
}

#[derive(Default)]
struct SchemaBuilder {
    schema: Schema,
    /// Index slots handed out per fully qualified path
    slots: HashMap<String, String>,
    slot_counter: usize,
}

impl SchemaBuilder {
    fn add_object(&mut self, object: &ObjectDef) -> Result<()> {
        if !FIELD_NAME_REGEX.is_match(&object.name) {
            return Err(CompileError::Schema(format!("Invalid object name: {}", object.name)));
        }
        if self.schema.objects.contains_key(&object.name) {
            return Err(CompileError::Schema(format!("Duplicate object: {}", object.name)));
        }
        for property in &object.properties {
            if BUILTIN_NAMES.contains(&property.name.as_str()) {
                return Err(CompileError::Schema(format!(
                    "Property {}.{} conflicts with a built-in property",
                    object.name, property.name
                )));
            }
        }

        self.slots.clear();
        self.slot_counter = 0;

        let typed = !object.types.is_empty();
        let mut models = Vec::new();

        let mut shared = builtins(typed);
        shared.extend(object.properties.iter().cloned());
        models.push(self.add_model(&object.name, None, typed, &shared, &[])?);

        for type_def in &object.types {
            if !FIELD_NAME_REGEX.is_match(&type_def.name) {
                return Err(CompileError::Schema(format!("Invalid type name: {}", type_def.name)));
            }
            for property in &type_def.properties {
                if shared.iter().any(|p| p.name == property.name) {
                    return Err(CompileError::Schema(format!(
                        "Property {}#{}.{} is already defined by the object",
                        object.name, type_def.name, property.name
                    )));
                }
            }
            models.push(self.add_model(
                &object.name,
                Some(&type_def.name),
                false,
                &shared,
                &type_def.properties,
            )?);
        }

        self.schema.objects.insert(object.name.clone(), models);
        Ok(())
    }

    fn add_model(
        &mut self,
        object_name: &str,
        type_name: Option<&str>,
        type_master: bool,
        shared: &[PropertyDef],
        specific: &[PropertyDef],
    ) -> Result<ModelId> {
        let model = ModelId(self.schema.models.len());
        let root = NodeId(self.schema.nodes.len());
        let mut root_node = SchemaNode::new(root, model, "", TypeName::Document);
        root_node.fqpp = object_name.to_string();
        self.schema.nodes.push(root_node);

        for property in shared {
            let id = self.add_property(model, root, "", object_name, None, property)?;
            self.schema.nodes[root.0].children.push(id);
        }
        if let Some(type_name) = type_name {
            let prefix = format!("{}#{}", object_name, type_name);
            for property in specific {
                let id = self.add_property(model, root, "", &prefix, Some(type_name), property)?;
                self.schema.nodes[root.0].children.push(id);
            }
        }

        self.schema.models.push(Model {
            id: model,
            object_name: object_name.to_string(),
            type_name: type_name.map(str::to_string),
            type_master,
            root,
            base: Vec::new(),
            projected: false,
        });
        Ok(model)
    }

    fn add_property(
        &mut self,
        model: ModelId,
        parent: NodeId,
        parent_path: &str,
        parent_fqpp: &str,
        declared_type: Option<&str>,
        def: &PropertyDef,
    ) -> Result<NodeId> {
        if !FIELD_NAME_REGEX.is_match(&def.name) {
            return Err(CompileError::Schema(format!("Invalid property name: {}", def.name)));
        }
        let type_name = TypeName::from_str(&def.type_name).ok_or_else(|| {
            CompileError::Schema(format!("Unknown type {} for property {}", def.type_name, def.name))
        })?;

        let id = NodeId(self.schema.nodes.len());
        let mut node = SchemaNode::new(id, model, &def.name, type_name);
        node.fullpath = join(parent_path, &def.name);
        node.fqpp = format!("{}.{}", parent_fqpp, def.name);
        node.parent = Some(parent);
        node.array = def.array || type_name == TypeName::Set;
        node.indexed = def.indexed;
        node.native_index = def.native_index;
        node.localized = def.localized;
        node.fixed_locale = def.fixed_locale.clone();
        node.is_virtual = def.is_virtual;
        node.reader = def.reader;
        node.group_reader = def.group_reader;
        node.readable = def.readable.unwrap_or(true);
        node.read_access = def.read_access.unwrap_or(AccessLevel::Read);
        node.acl = def.acl;
        node.expandable = def.expandable;
        node.dependencies = def.dependencies.clone();
        node.declared_type = declared_type.map(str::to_string);
        if def.indexed {
            node.slot = Some(self.slot_for(&node.fqpp, def.slot.as_deref())?);
        }
        if type_name == TypeName::Set {
            node.discriminator_key = Some(
                def.discriminator_key
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DISCRIMINATOR.to_string()),
            );
        }

        let fullpath = node.fullpath.clone();
        let fqpp = node.fqpp.clone();
        let discriminator = node.discriminator_key.clone();
        self.schema.nodes.push(node);

        match type_name {
            TypeName::Document => {
                for child in &def.properties {
                    let child_id =
                        self.add_property(model, id, &fullpath, &fqpp, declared_type, child)?;
                    self.schema.nodes[id.0].children.push(child_id);
                }
            }
            TypeName::Set => {
                let key = discriminator.unwrap_or_else(|| DEFAULT_DISCRIMINATOR.to_string());
                for document in &def.documents {
                    let doc_id = self.add_set_document(
                        model,
                        id,
                        &fullpath,
                        &fqpp,
                        declared_type,
                        &key,
                        document,
                    )?;
                    self.schema.nodes[id.0].children.push(doc_id);
                }
            }
            _ => {}
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_set_document(
        &mut self,
        model: ModelId,
        set: NodeId,
        set_path: &str,
        set_fqpp: &str,
        declared_type: Option<&str>,
        discriminator_key: &str,
        document: &DocumentDef,
    ) -> Result<NodeId> {
        if !FIELD_NAME_REGEX.is_match(&document.name) {
            return Err(CompileError::Schema(format!("Invalid document name: {}", document.name)));
        }
        let id = NodeId(self.schema.nodes.len());
        let mut node = SchemaNode::new(id, model, &document.name, TypeName::Document);
        node.fullpath = set_path.to_string();
        node.fqpp = format!("{}#{}", set_fqpp, document.name);
        node.parent = Some(set);
        node.declared_type = declared_type.map(str::to_string);
        let fqpp = node.fqpp.clone();
        self.schema.nodes.push(node);

        let mut properties = document.properties.clone();
        if !properties.iter().any(|p| p.name == discriminator_key) {
            properties.insert(0, PropertyDef::discriminator(discriminator_key));
        }
        for property in &properties {
            let child = self.add_property(model, id, set_path, &fqpp, declared_type, property)?;
            self.schema.nodes[id.0].children.push(child);
        }
        Ok(id)
    }

    fn slot_for(&mut self, fqpp: &str, requested: Option<&str>) -> Result<String> {
        if let Some(slot) = requested {
            if !SLOT_REGEX.is_match(slot) {
                return Err(CompileError::Schema(format!("Invalid index slot {} for {}", slot, fqpp)));
            }
            self.slots.insert(fqpp.to_string(), slot.to_string());
            return Ok(slot.to_string());
        }
        if let Some(slot) = self.slots.get(fqpp) {
            return Ok(slot.clone());
        }
        self.slot_counter += 1;
        let slot = format!("i{}", self.slot_counter);
        self.slots.insert(fqpp.to_string(), slot.clone());
        Ok(slot)
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_and_models() {
        let schema = load(&json!({
            "objects": [{
                "name": "c_pet",
                "properties": [{"name": "c_name", "type": "String"}],
                "types": [{"name": "c_dog", "properties": []}]
            }]
        }))
        .unwrap();

        let models = schema.object_models("c_pet").unwrap();
        assert_eq!(models.len(), 2);
        let master = schema.model(models[0]).unwrap();
        assert!(master.type_master);
        let dog = schema.model(models[1]).unwrap();
        assert_eq!(dog.qualified_name(), "c_pet#c_dog");

        let root = schema.node(master.root).unwrap();
        let names: Vec<&str> = root
            .children
            .iter()
            .map(|id| schema.node(*id).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["_id", "object", "type", "created", "c_name"]);
        let id = schema.node(root.children[0]).unwrap();
        assert!(id.native_index);
        assert_eq!(id.type_name, TypeName::ObjectId);
    }

    #[test]
    fn test_type_specific_fqpp_and_slots() {
        let schema = load(&json!({
            "objects": [{
                "name": "c_pet",
                "properties": [{"name": "c_name", "type": "String", "indexed": true}],
                "types": [
                    {"name": "c_dog", "properties": [{"name": "c_flag", "type": "Boolean", "indexed": true, "slot": "i5"}]},
                    {"name": "c_cat", "properties": [{"name": "c_flag", "type": "Boolean", "indexed": true, "slot": "i6"}]}
                ]
            }]
        }))
        .unwrap();

        let flags: Vec<&SchemaNode> = schema.nodes.iter().filter(|n| n.name == "c_flag").collect();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].fqpp, "c_pet#c_dog.c_flag");
        assert_eq!(flags[0].slot.as_deref(), Some("i5"));
        assert_eq!(flags[1].slot.as_deref(), Some("i6"));

        // shared properties keep one slot in every model
        let names: Vec<&SchemaNode> = schema.nodes.iter().filter(|n| n.name == "c_name").collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.slot == names[0].slot && n.fqpp == "c_pet.c_name"));
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let err = load(&json!({"objects": [{"name": "c_a", "properties": [{"name": "c_x", "type": "Blob"}]}]}))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown type Blob"));

        let err = load(&json!({"objects": [{"name": "c_a", "properties": [{"name": "created", "type": "Date"}]}]}))
            .unwrap_err();
        assert!(err.to_string().contains("built-in"));

        assert!(load(&json!({"objects": [{"properties": []}]})).is_err());
    }

    #[test]
    fn test_set_discriminator_is_added() {
        let schema = load(&json!({
            "objects": [{
                "name": "c_a",
                "properties": [{"name": "c_set", "type": "Set", "documents": [
                    {"name": "c_doc", "properties": [{"name": "c_x", "type": "Number"}]}
                ]}]
            }]
        }))
        .unwrap();
        let discriminator = schema
            .nodes
            .iter()
            .find(|n| n.name == "name")
            .unwrap();
        assert_eq!(discriminator.fullpath, "c_set.name");
        assert_eq!(discriminator.fqpp, "c_a.c_set#c_doc.name");
    }

    #[test]
    fn test_sets_nested_in_set_documents() {
        let schema = load(&json!({
            "objects": [{
                "name": "c_a",
                "properties": [{"name": "c_set", "type": "Set", "documents": [
                    {"name": "c_doc", "properties": [
                        {"name": "c_inner", "type": "Set", "documents": [
                            {"name": "c_leaf", "properties": [{"name": "c_y", "type": "String"}]}
                        ]}
                    ]}
                ]}]
            }]
        }))
        .unwrap();
        let leaf = schema.nodes.iter().find(|n| n.name == "c_leaf").unwrap();
        assert_eq!(leaf.type_name, TypeName::Document);
        assert!(schema.nodes.iter().any(|n| n.name == "c_y" && n.parent == Some(leaf.id)));
    }
}
