// schema_helpers.rs
// Shared schema fixture for integration tests

#![allow(dead_code)]

use queryforge_core::{CompiledPipeline, CompilerOptions, PipelineCompiler, Result, Schema};
use serde_json::{json, Value};

pub fn schema_document() -> Value {
    json!({
        "objects": [
            {
                "name": "c_pet",
                "properties": [
                    {"name": "c_name", "type": "String"},
                    {"name": "c_age", "type": "Number"},
                    {"name": "c_tags", "type": "String", "array": true},
                    {"name": "c_owner", "type": "Reference", "expandable": true},
                    {"name": "c_title", "type": "String", "localized": true},
                    {"name": "c_code", "type": "String", "indexed": true, "slot": "u1"},
                    {"name": "c_secret", "type": "String", "readAccess": "delete"},
                    {"name": "c_born", "type": "Date"},
                    {"name": "c_visits", "type": "Document", "array": true, "properties": [
                        {"name": "c_when", "type": "Date"},
                        {"name": "c_score", "type": "Number"}
                    ]},
                    {"name": "c_label", "type": "String", "reader": true, "dependencies": ["c_name"]}
                ],
                "types": [
                    {"name": "c_dog", "properties": [
                        {"name": "c_flag", "type": "Boolean", "indexed": true, "slot": "i5"}
                    ]},
                    {"name": "c_cat", "properties": [
                        {"name": "c_flag", "type": "Boolean", "indexed": true, "slot": "i6"}
                    ]}
                ]
            },
            {
                "name": "c_note",
                "properties": [{"name": "c_body", "type": "String"}]
            }
        ],
        "indexes": {
            "contexts": [
                {"name": "object_created", "fields": ["org", "object", "created"]},
                {"name": "object_name", "fields": ["org", "object", "c_name"]}
            ]
        }
    })
}

pub fn schema() -> Schema {
    Schema::from_value(&schema_document()).expect("fixture schema loads")
}

/// Options under which the first stages are checked against indexes
pub fn indexed_options() -> CompilerOptions {
    let base_find = json!({"org": 1, "object": "c_pet"});
    CompilerOptions::new("c_pet").with_base_find(base_find.as_object().cloned().unwrap_or_default())
}

/// Options with index checks switched off
pub fn plain_options() -> CompilerOptions {
    CompilerOptions::new("c_pet").with_skip_index_checks(true)
}

pub fn compile(options: CompilerOptions, pipeline: Value) -> Result<CompiledPipeline> {
    let schema = schema();
    PipelineCompiler::new(&schema, options).compile(&pipeline)
}
