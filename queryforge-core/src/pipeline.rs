// queryforge-core/src/pipeline.rs
// Pipeline compiler: stage sequencing, model hand-off and the compiled result

use crate::error::{CompileError, Result};
use crate::limits::{exceeds, MAX_STAGES};
use crate::options::CompilerOptions;
use crate::property::CandidateProperty;
use crate::schema::{AccessLevel, AccessPolicy, AllowAll, Catalog, IndexCatalog, ModelId, Schema};
use crate::stage::{compile_stage, Expansion, StageContext, StageKind};
use crate::{log_debug, log_info};
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;

static ALLOW_ALL: AllowAll = AllowAll;

/// One compiled stage
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledStage {
    pub kind: StageKind,
    pub json: Value,
    /// Every stage up to and including this one is index eligible
    pub uses_index: bool,
}

/// Result of compiling a pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPipeline {
    pub stages: Vec<CompiledStage>,
    /// Highest read access of the nodes the pipeline reads without their own acl
    pub required_access: AccessLevel,
    /// Sorted, distinct `{{variable}}` names
    pub variables: Vec<String>,
    pub expansions: Vec<Expansion>,
    pub uses_index: bool,
    #[serde(skip)]
    built: OnceLock<Value>,
}

impl CompiledPipeline {
    /// The native pipeline array
    pub fn build(&self) -> &Value {
        self.built
            .get_or_init(|| Value::Array(self.stages.iter().map(|stage| stage.json.clone()).collect()))
    }

    /// Only `$match`, `$sort`, `$limit` and `$skip`: runnable as a plain find
    pub fn can_be_called_as_query(&self) -> bool {
        self.stages.iter().all(|stage| stage.kind.is_query_compatible())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// A stage waiting to be compiled
struct PendingStage {
    kind: StageKind,
    value: Value,
    skip_acl: bool,
}

/// Compiles aggregation pipelines against one schema
pub struct PipelineCompiler<'s> {
    schema: &'s Schema,
    options: CompilerOptions,
    policy: &'s dyn AccessPolicy,
    indexes: &'s dyn IndexCatalog,
}

impl<'s> PipelineCompiler<'s> {
    /// Every acl check passes and indexes come from the schema document
    pub fn new(schema: &'s Schema, options: CompilerOptions) -> Self {
        PipelineCompiler {
            schema,
            options,
            policy: &ALLOW_ALL,
            indexes: schema,
        }
    }

    pub fn with_policy(mut self, policy: &'s dyn AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_index_catalog(mut self, indexes: &'s dyn IndexCatalog) -> Self {
        self.indexes = indexes;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn compile_str(&self, pipeline: &str) -> Result<CompiledPipeline> {
        self.compile(&Value::String(pipeline.to_string()))
    }

    /// Compile a pipeline given as an array, a single stage object or a JSON string
    pub fn compile(&self, pipeline: &Value) -> Result<CompiledPipeline> {
        let stages = self.pending_stages(pipeline)?;
        let kinds: Vec<StageKind> = stages.iter().map(|stage| stage.kind).collect();

        let mut catalog = Catalog::new(self.schema);
        let mut models: Vec<ModelId> = catalog.object_models(&self.options.object)?;
        let mut properties: Vec<CandidateProperty> = Vec::new();
        let mut uses_index = !self.options.skip_index_checks;
        let mut prior_index_keys: Vec<String> = Vec::new();
        let mut required_access = AccessLevel::None;
        let mut variables: Vec<String> = Vec::new();
        let mut expansions: Vec<Expansion> = Vec::new();
        let mut compiled = Vec::with_capacity(stages.len());

        for (position, stage) in stages.into_iter().enumerate() {
            uses_index = uses_index && stage.kind.indexable();

            let (output, access) = {
                let mut ctx = StageContext::new(&catalog, &self.options, self.policy, self.indexes, stage.kind);
                ctx.position = position;
                ctx.input_models = models.clone();
                ctx.input_properties = std::mem::take(&mut properties);
                ctx.uses_index = uses_index;
                ctx.skip_acl = stage.skip_acl;
                ctx.later_stages = kinds[position + 1..].to_vec();
                ctx.prior_index_keys = prior_index_keys.clone();
                let output = compile_stage(&stage.value, &ctx)?;
                (output, ctx.required_access.get())
            };
            required_access = required_access.max(access);

            if uses_index {
                for key in &output.index_keys {
                    if !prior_index_keys.contains(key) {
                        prior_index_keys.push(key.clone());
                    }
                }
            }

            match &output.projection {
                Some(projection) => {
                    let base = if projection.extends_input { output.models.clone() } else { Vec::new() };
                    let type_name = catalog.agreed_type_name(&output.models);
                    let model = catalog.add_projected_model(&self.options.object, type_name, &projection.nodes, base);
                    log_debug!(
                        "{} stage {} projects {} fields",
                        stage.kind.key(),
                        position,
                        projection.nodes.len()
                    );
                    models = vec![model];
                    properties = Vec::new();
                }
                None => {
                    models = output.models;
                    properties = output.properties;
                }
            }

            variables.extend(output.variables);
            expansions.extend(output.expansions);
            compiled.push(CompiledStage {
                kind: stage.kind,
                json: output.json,
                uses_index,
            });
        }

        variables.sort();
        variables.dedup();

        let pipeline = CompiledPipeline {
            uses_index: compiled.first().map_or(false, |stage| stage.uses_index),
            stages: compiled,
            required_access,
            variables,
            expansions,
            built: OnceLock::new(),
        };
        log_info!(
            "compiled {} stage pipeline on {} (required access {})",
            pipeline.len(),
            self.options.object,
            pipeline.required_access.as_str()
        );
        Ok(pipeline)
    }

    /// Internal pre-stages followed by the caller's stages, each checked for shape
    fn pending_stages(&self, pipeline: &Value) -> Result<Vec<PendingStage>> {
        let parsed;
        let pipeline = match pipeline {
            Value::String(s) => {
                parsed = serde_json::from_str::<Value>(s)
                    .map_err(|_| CompileError::invalid("Invalid pipeline JSON format", ""))?;
                &parsed
            }
            other => other,
        };
        let items: Vec<Value> = match pipeline {
            Value::Null => Vec::new(),
            Value::Array(items) => items.clone(),
            Value::Object(_) => vec![pipeline.clone()],
            _ => return Err(CompileError::invalid("Array expected for pipeline", "")),
        };

        if exceeds(self.options.limits().max_stages, items.len()) {
            return Err(CompileError::invalid(
                format!("Invalid pipeline. Maximum stages ({}) exceeded", MAX_STAGES),
                "",
            ));
        }

        let mut stages = Vec::with_capacity(items.len() + 2);
        let internal = [
            (StageKind::Match, &self.options.pre_match),
            (StageKind::Sort, &self.options.pre_sort),
        ];
        for (kind, value) in internal {
            if let Some(value) = value.as_ref().filter(|v| !is_empty_stage_value(v)) {
                stages.push(PendingStage {
                    kind,
                    value: value.clone(),
                    skip_acl: true,
                });
            }
        }
        for (i, item) in items.into_iter().enumerate() {
            stages.push(pending_stage(i, item)?);
        }
        Ok(stages)
    }
}

fn pending_stage(i: usize, item: Value) -> Result<PendingStage> {
    let item = match item {
        Value::String(s) => serde_json::from_str::<Value>(&s).map_err(|_| {
            CompileError::invalid(format!("Invalid pipeline stage ({}) JSON format", i), "")
        })?,
        other => other,
    };
    let map = match item {
        Value::Object(map) => map,
        _ => {
            return Err(CompileError::invalid(
                format!("Object expected for pipeline stage ({})", i),
                "",
            ))
        }
    };
    if map.len() != 1 {
        return Err(CompileError::invalid(format!("stage ({}) requires a single key", i), ""));
    }
    let Some((key, value)) = map.into_iter().next() else {
        return Err(CompileError::invalid(format!("stage ({}) requires a single key", i), ""));
    };
    let kind = StageKind::from_key(&key)
        .ok_or_else(|| CompileError::invalid(format!("\"{}\" is not a valid pipeline stage.", key), ""))?;
    if is_empty_stage_value(&value) {
        return Err(CompileError::invalid(
            format!("Empty {} pipeline stage ({})", key, i),
            "",
        ));
    }
    Ok(PendingStage {
        kind,
        value,
        skip_acl: false,
    })
}

fn is_empty_stage_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::stage::testing::fixture;
    use serde_json::json;

    fn compile_with(options: CompilerOptions, pipeline: Value) -> Result<CompiledPipeline> {
        let schema = fixture();
        PipelineCompiler::new(&schema, options).compile(&pipeline)
    }

    fn compile(pipeline: Value) -> Result<CompiledPipeline> {
        compile_with(CompilerOptions::new("c_pet"), pipeline)
    }

    fn indexed_options() -> CompilerOptions {
        CompilerOptions::new("c_pet").with_base_find(json!({"org": 1, "object": "c_pet"}).as_object().unwrap().clone())
    }

    fn reason(pipeline: Value) -> String {
        compile(pipeline).unwrap_err().reason()
    }

    // ========== Pipeline shape ==========

    #[test]
    fn test_pipeline_shapes() {
        assert!(compile(json!([])).unwrap().is_empty());
        assert!(compile(Value::Null).unwrap().is_empty());
        assert_eq!(compile(json!({"$limit": 5})).unwrap().build(), &json!([{"$limit": 5}]));
        assert_eq!(compile(json!("[{\"$skip\": 2}]")).unwrap().build(), &json!([{"$skip": 2}]));
        assert_eq!(reason(json!("[{")), "Invalid pipeline JSON format");
        assert_eq!(reason(json!(5)), "Array expected for pipeline");
    }

    #[test]
    fn test_stage_shapes() {
        assert_eq!(reason(json!(["{oops"])), "Invalid pipeline stage (0) JSON format");
        assert_eq!(reason(json!([{"$limit": 1}, 7])), "Object expected for pipeline stage (1)");
        assert_eq!(reason(json!([{"$limit": 1, "$skip": 1}])), "stage (0) requires a single key");
        assert_eq!(reason(json!([{"$lookup": {}}])), "\"$lookup\" is not a valid pipeline stage.");
        assert_eq!(reason(json!([{"$limit": 1}, {"$match": {}}])), "Empty $match pipeline stage (1)");
        assert_eq!(
            compile(json!(["{\"$limit\": 3}"])).unwrap().build(),
            &json!([{"$limit": 3}])
        );
    }

    #[test]
    fn test_maximum_stages() {
        let stages: Vec<Value> = (0..21).map(|_| json!({"$skip": 1})).collect();
        assert_eq!(
            reason(Value::Array(stages.clone())),
            "Invalid pipeline. Maximum stages (20) exceeded"
        );
        let relaxed = CompilerOptions::new("c_pet").with_relax_limits(true);
        assert_eq!(compile_with(relaxed, Value::Array(stages)).unwrap().len(), 21);
    }

    #[test]
    fn test_unknown_object() {
        let err = compile_with(CompilerOptions::new("c_missing"), json!([])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    // ========== Index eligibility ==========

    #[test]
    fn test_uses_index_is_a_prefix() {
        let out = compile_with(indexed_options(), json!([
            {"$match": {"c_name": "rex"}},
            {"$sort": {"created": -1}},
            {"$limit": 10},
            {"$match": {"c_age": 3}}
        ]))
        .unwrap();
        assert_eq!(out.stages[0].json, json!({"$match": {"org": 1, "object": "c_pet", "c_name": "rex"}}));
        let flags: Vec<bool> = out.stages.iter().map(|s| s.uses_index).collect();
        assert_eq!(flags, vec![true, true, false, false]);
        assert!(out.uses_index);
        assert!(out.can_be_called_as_query());

        let skipped = compile_with(
            CompilerOptions::new("c_pet").with_skip_index_checks(true),
            json!([{"$match": {"c_name": "rex"}}]),
        )
        .unwrap();
        assert!(!skipped.uses_index);
    }

    #[test]
    fn test_group_is_not_a_query() {
        let out = compile(json!([{"$group": {"_id": "c_name", "c_n": {"$count": "c_name"}}}])).unwrap();
        assert!(!out.can_be_called_as_query());
        assert!(!out.uses_index);
    }

    // ========== Projection hand-off ==========

    #[test]
    fn test_projected_fields_resolve_downstream() {
        let out = compile(json!([
            {"$project": {"c_years": "c_age"}},
            {"$match": {"c_years": {"$gt": 2}}}
        ]))
        .unwrap();
        assert_eq!(out.stages[1].json, json!({"$match": {"c_years": {"$gt": 2}}}));

        assert_eq!(
            reason(json!([{"$project": {"c_years": "c_age"}}, {"$match": {"c_name": "rex"}}])),
            "strict: there are no properties that could match rex in $match stage 1"
        );
    }

    #[test]
    fn test_add_fields_keeps_input_paths() {
        let out = compile(json!([
            {"$addFields": {"c_next": {"$add": ["c_age", 1]}}},
            {"$project": {"c_name": 1, "c_next": 1}}
        ]))
        .unwrap();
        assert_eq!(out.stages[1].json, json!({"$project": {"_id": 1, "c_name": 1, "c_next": 1}}));
    }

    #[test]
    fn test_grouped_output_feeds_sort() {
        let out = compile(json!([
            {"$group": {"_id": "c_name", "c_total": {"$sum": "c_age"}}},
            {"$sort": {"c_total": -1}}
        ]))
        .unwrap();
        assert_eq!(out.stages[1].json, json!({"$sort": {"c_total": -1}}));
    }

    #[test]
    fn test_expand_before_group_is_rejected() {
        assert_eq!(
            reason(json!([
                {"$project": {"c_owner": {"$expand": 1}}},
                {"$group": {"_id": "c_owner"}}
            ])),
            "$expand must appear in the last transformational stage ($group 1)"
        );
    }

    // ========== Collected output ==========

    #[test]
    fn test_variables_are_sorted_and_distinct() {
        let out = compile_with(
            CompilerOptions::new("c_pet").with_variables(true).with_skip_index_checks(true),
            json!([
                {"$match": {"c_name": "{{name}}"}},
                {"$limit": "{{count}}"},
                {"$skip": "{{name}}"}
            ]),
        )
        .unwrap();
        assert_eq!(out.variables, vec!["count".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_expansions_are_collected() {
        let out = compile(json!([{"$project": {"c_owner": {"$expand": ["c_name"]}}}])).unwrap();
        assert_eq!(out.expansions.len(), 1);
        assert_eq!(out.expansions[0].path, "c_owner");
    }

    #[test]
    fn test_required_access_is_the_maximum() {
        let out = compile_with(
            CompilerOptions::new("c_pet").with_skip_index_checks(true),
            json!([{"$match": {"c_secret": "x"}}, {"$sort": {"c_name": 1}}]),
        )
        .unwrap();
        assert_eq!(out.required_access, AccessLevel::Delete);
    }

    #[test]
    fn test_pre_stages_are_prepended() {
        let options = indexed_options()
            .with_pre_match(json!({"c_name": "rex"}))
            .with_pre_sort(json!({}));
        let out = compile_with(options, json!([{"$limit": 1}])).unwrap();
        let kinds: Vec<StageKind> = out.stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StageKind::Match, StageKind::Limit]);
        assert_eq!(out.stages[0].json, json!({"$match": {"org": 1, "object": "c_pet", "c_name": "rex"}}));
        assert!(out.stages[0].uses_index);
    }

    #[test]
    fn test_build_is_memoized() {
        let out = compile(json!([{"$limit": 2}])).unwrap();
        let first = out.build() as *const Value;
        assert_eq!(first, out.build() as *const Value);
    }

    #[test]
    fn test_serializes_for_callers() {
        let out = compile(json!([{"$limit": 2}])).unwrap();
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["requiredAccess"], json!("none"));
        assert_eq!(value["stages"][0]["json"], json!({"$limit": 2}));
        assert_eq!(value["usesIndex"], json!(false));
    }
}
