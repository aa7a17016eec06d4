// pipeline_integration_tests.rs
// End-to-end pipeline compiles through the public API

mod schema_helpers;

use queryforge_core::{AccessLevel, CompilerOptions, ErrorKind, PipelineCompiler, Schema, StageKind};
use schema_helpers::*;
use serde_json::{json, Value};
use std::fs;

// ========== Matching ==========

#[test]
fn test_logical_siblings_merge_without_and() {
    let out = compile(
        plain_options(),
        json!([{"$match": {"c_name": "a", "$or": [{"c_age": {"$gt": 1}}, {"c_age": {"$lt": 0}}]}}]),
    )
    .unwrap();
    assert_eq!(
        out.build(),
        &json!([{"$match": {"c_name": "a", "$or": [{"c_age": {"$gt": 1}}, {"c_age": {"$lt": 0}}]}}])
    );
}

#[test]
fn test_divergent_index_slots_become_an_or() {
    let out = compile(indexed_options(), json!([{"$match": {"c_flag": true}}])).unwrap();
    assert_eq!(
        out.stages[0].json,
        json!({"$match": {"$and": [
            {"c_flag": true, "org": 1, "object": "c_pet"},
            {"$or": [
                {"org": 1, "object": "c_pet", "idx.d.i5": true},
                {"org": 1, "object": "c_pet", "idx.d.i6": true}
            ]}
        ]}})
    );
    assert!(out.uses_index);
}

#[test]
fn test_unindexed_first_match_is_rejected() {
    let err = compile(indexed_options(), json!([{"$match": {"c_age": 5}}])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(
        err.reason(),
        "Matches can only occur on indexed properties. c_pet.c_age is either not indexed or is missing a preceding index key."
    );

    // Once a stage breaks the index prefix the same match is fine
    let out = compile(
        indexed_options(),
        json!([{"$match": {"c_name": "rex"}}, {"$limit": 5}, {"$match": {"c_age": 5}}]),
    )
    .unwrap();
    assert_eq!(out.stages[2].json, json!({"$match": {"c_age": 5}}));
}

#[test]
fn test_unknown_property_in_strict_mode() {
    let err = compile(plain_options(), json!([{"$match": {"c_missing": 1}}])).unwrap_err();
    assert_eq!(
        err.reason(),
        "strict: there are no properties that could match 1 in $match stage 0"
    );
    let relaxed = plain_options().with_strict(false);
    assert!(compile(relaxed, json!([{"$match": {"c_missing": 1}}])).is_ok());
}

// ========== Transformations ==========

#[test]
fn test_project_rejects_fields_mixed_with_operators() {
    let err = compile(
        plain_options(),
        json!([{"$project": {"c_total": {"$add": ["c_age", 1], "c_name": 1}}}]),
    )
    .unwrap_err();
    assert_eq!(err.reason(), "operator expressions cannot mix field names with operators");
}

#[test]
fn test_report_pipeline() {
    let out = compile(
        indexed_options(),
        json!([
            {"$match": {"c_name": "rex"}},
            {"$group": {"_id": "c_name", "c_total": {"$sum": "c_age"}}},
            {"$sort": {"c_total": -1}},
            {"$limit": "10"}
        ]),
    )
    .unwrap();

    assert_eq!(
        out.build(),
        &json!([
            {"$match": {"org": 1, "object": "c_pet", "c_name": "rex"}},
            {"$group": {
                "_id": "$c_name",
                "c_total": {"$sum": "$c_age"},
                "object": {"$first": {"$literal": "c_pet"}}
            }},
            {"$sort": {"c_total": -1}},
            {"$limit": 10}
        ])
    );
    let kinds: Vec<StageKind> = out.stages.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![StageKind::Match, StageKind::Group, StageKind::Sort, StageKind::Limit]);
    let flags: Vec<bool> = out.stages.iter().map(|s| s.uses_index).collect();
    assert_eq!(flags, vec![true, false, false, false]);
    assert!(!out.can_be_called_as_query());
}

#[test]
fn test_projection_narrows_later_stages() {
    let err = compile(
        plain_options(),
        json!([{"$project": {"c_years": "c_age"}}, {"$sort": {"c_name": 1}}]),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let out = compile(
        plain_options(),
        json!([{"$project": {"c_years": "c_age"}}, {"$sort": {"c_years": 1}}]),
    )
    .unwrap();
    assert_eq!(out.stages[1].json, json!({"$sort": {"c_years": 1}}));
}

// ========== Access ==========

#[test]
fn test_required_access_reported() {
    let out = compile(plain_options(), json!([{"$match": {"c_secret": "x"}}])).unwrap();
    assert_eq!(out.required_access, AccessLevel::Delete);
    let value = serde_json::to_value(&out).unwrap();
    assert_eq!(value["requiredAccess"], json!("delete"));

    let out = compile(plain_options(), json!([{"$match": {"c_name": "x"}}])).unwrap();
    assert!(out.required_access < AccessLevel::Delete);
}

// ========== Variables ==========

#[test]
fn test_variables_across_stages() {
    let options = plain_options().with_variables(true);
    let out = compile(
        options,
        json!([
            {"$match": {"c_name": "{{name}}"}},
            {"$skip": "{{offset}}"},
            {"$limit": "{{pageSize}}"},
            {"$match": {"c_age": {"$gt": "{{name}}"}}}
        ]),
    )
    .unwrap();
    assert_eq!(out.variables, vec!["name", "offset", "pageSize"]);
    assert_eq!(out.stages[2].json, json!({"$limit": "{{pageSize}}"}));

    let err = compile(plain_options(), json!([{"$limit": "{{pageSize}}"}])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// ========== Compiler behaviour ==========

#[test]
fn test_compiles_are_repeatable() {
    let schema = schema();
    let compiler = PipelineCompiler::new(&schema, indexed_options());
    let pipeline = json!([
        {"$match": {"c_flag": true}},
        {"$unwind": "c_tags"},
        {"$project": {"c_name": 1, "c_tags": 1, "c_next": {"$add": ["c_age", 1]}}}
    ]);
    let first = compiler.compile(&pipeline).unwrap();
    let second = compiler.compile(&pipeline).unwrap();
    assert_eq!(first.build(), second.build());
    assert_eq!(first.required_access, second.required_access);
}

#[test]
fn test_pipeline_from_text() {
    let schema = schema();
    let compiler = PipelineCompiler::new(&schema, plain_options());
    let out = compiler.compile_str(r#"[{"$skip": 5}, {"$limit": 5}]"#).unwrap();
    assert_eq!(out.build(), &json!([{"$skip": 5}, {"$limit": 5}]));
    let err = compiler.compile_str("[{").unwrap_err();
    assert_eq!(err.reason(), "Invalid pipeline JSON format");
}

#[test]
fn test_schema_loaded_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schema.json");
    fs::write(&path, serde_json::to_string_pretty(&schema_document()).unwrap()).unwrap();

    let schema = Schema::from_json_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(schema.object_names(), vec!["c_note", "c_pet"]);

    let options = CompilerOptions::new("c_note").with_skip_index_checks(true);
    let out = PipelineCompiler::new(&schema, options)
        .compile(&json!([{"$match": {"c_body": "hello"}}]))
        .unwrap();
    assert_eq!(out.build(), &json!([{"$match": {"c_body": "hello"}}]));
}

#[test]
fn test_empty_and_oversized_pipelines() {
    assert!(compile(plain_options(), json!([])).unwrap().is_empty());
    let stages: Vec<Value> = (0..21).map(|_| json!({"$limit": 1})).collect();
    let err = compile(plain_options(), Value::Array(stages)).unwrap_err();
    assert_eq!(err.reason(), "Invalid pipeline. Maximum stages (20) exceeded");
}
