// queryforge-core/src/stage/testing.rs
// Shared schema fixture for stage unit tests

use super::{StageContext, StageKind};
use crate::options::CompilerOptions;
use crate::schema::{AllowAll, Catalog, Schema};
use serde_json::json;

static ALLOW_ALL: AllowAll = AllowAll;

pub fn fixture() -> Schema {
    Schema::from_value(&json!({
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
                    {"name": "c_virtual", "type": "String", "virtual": true},
                    {"name": "c_born", "type": "Date"},
                    {"name": "c_doc", "type": "Document", "properties": [
                        {"name": "c_inner", "type": "Number"}
                    ]},
                    {"name": "c_visits", "type": "Document", "array": true, "properties": [
                        {"name": "c_when", "type": "Date"},
                        {"name": "c_score", "type": "Number"}
                    ]},
                    {"name": "c_loc", "type": "Geometry"},
                    {"name": "c_label", "type": "String", "reader": true, "dependencies": ["c_name"]},
                    {"name": "c_friends", "type": "Reference", "array": true},
                    {"name": "c_set", "type": "Set", "documents": [
                        {"name": "c_a", "properties": [{"name": "c_x", "type": "Number"}]},
                        {"name": "c_b", "properties": [{"name": "c_y", "type": "String"}]}
                    ]}
                ],
                "types": [
                    {"name": "c_dog", "properties": [
                        {"name": "c_flag", "type": "Boolean", "indexed": true, "slot": "i5"},
                        {"name": "c_bark", "type": "Boolean"}
                    ]},
                    {"name": "c_cat", "properties": [
                        {"name": "c_flag", "type": "Boolean", "indexed": true, "slot": "i6"},
                        {"name": "c_meow", "type": "Boolean"}
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
    }))
    .unwrap()
}

/// A first-stage context over `options.object`
pub fn context<'c, 's>(
    catalog: &'c Catalog<'s>,
    options: &'c CompilerOptions,
    kind: StageKind,
    uses_index: bool,
) -> StageContext<'c, 's> {
    let schema: &'s Schema = catalog.schema();
    let mut ctx = StageContext::new(catalog, options, &ALLOW_ALL, schema, kind);
    ctx.input_models = catalog.object_models(&options.object).unwrap();
    ctx.uses_index = uses_index;
    ctx
}
