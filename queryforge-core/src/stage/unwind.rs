// queryforge-core/src/stage/unwind.rs
// `$unwind` stage: one array path, narrowed to a scalar for later stages

use super::{
    filter_by_discriminators, is_shorthand_name, normalize_stage_value, StageContext, StageKind, StageOutput,
};
use crate::error::{CompileError, Result};
use crate::property::{find_property, CandidateProperty};
use crate::value_utils::normalize_property_path;
use serde_json::{json, Map, Value};

enum UnwindPath {
    Property(String),
    Variable(String),
}

/// Compile one `$unwind` stage value
pub fn compile(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    let path = parse(&normalize(value)?, ctx)?;

    let (json, properties, variables) = match path {
        UnwindPath::Variable(name) => (
            json!({ "$unwind": { "path": format!("{{{{{}}}}}", name) } }),
            ctx.input_properties.clone(),
            vec![name],
        ),
        UnwindPath::Property(path) => {
            let properties = resolve_properties(&path, ctx)?;
            validate(&path, &properties, ctx)?;
            (json!({ "$unwind": { "path": format!("${}", path) } }), properties, Vec::new())
        }
    };

    Ok(StageOutput {
        json,
        models: ctx.input_models.clone(),
        properties,
        projection: None,
        variables,
        expansions: Vec::new(),
        index_keys: Vec::new(),
    })
}

/// `"c_tags"` is `{path: "c_tags"}`
fn normalize(value: &Value) -> Result<Map<String, Value>> {
    match value {
        Value::String(s) if is_shorthand_name(s, true) => {
            let mut map = Map::new();
            map.insert("path".to_string(), Value::String(s.clone()));
            Ok(map)
        }
        other => normalize_stage_value(StageKind::Unwind, other),
    }
}

fn parse(map: &Map<String, Value>, ctx: &StageContext<'_, '_>) -> Result<UnwindPath> {
    if map.len() != 1 {
        return Err(CompileError::invalid(
            "Unwinding must consist of a single path component",
            "",
        ));
    }
    let (key, value) = match map.iter().next() {
        Some(entry) => entry,
        None => return Err(CompileError::invalid("Unwinding must consist of a single path component", "")),
    };
    if key != "path" {
        return Err(CompileError::invalid("Invalid unwind property.", key.clone()));
    }
    if let Some(name) = ctx.variable(value) {
        return Ok(UnwindPath::Variable(name));
    }
    match value {
        Value::String(s) => {
            if s.is_empty() || normalize_property_path(s) != *s {
                Err(CompileError::invalid(format!("Invalid $unwind property name: ({})", s), "path"))
            } else {
                Ok(UnwindPath::Property(s.clone()))
            }
        }
        _ => Err(CompileError::invalid("$unwind property must be a property name", "path")),
    }
}

/// Replace (or add) the unwound path as a non-array property
fn resolve_properties(path: &str, ctx: &StageContext<'_, '_>) -> Result<Vec<CandidateProperty>> {
    let mut properties = ctx.input_properties.clone();
    match properties.iter().position(|p| p.path == path) {
        Some(pos) => {
            if properties[pos].is_array != Some(false) {
                let nodes = properties[pos].nodes.clone();
                properties[pos] = CandidateProperty::new(path, nodes).with_array(Some(false));
            }
        }
        None => {
            let nodes = filter_by_discriminators(ctx, ctx.catalog.gather_nodes(&ctx.input_models, path));
            if nodes.is_empty() && ctx.strict() {
                return Err(CompileError::invalid(
                    "strict: there are no properties that could be unwound.",
                    path,
                ));
            }
            properties.push(CandidateProperty::new(path, nodes).with_array(Some(false)));
        }
    }
    Ok(properties)
}

fn validate(path: &str, properties: &[CandidateProperty], ctx: &StageContext<'_, '_>) -> Result<()> {
    let property = find_property(properties, path)
        .ok_or_else(|| CompileError::invalid("Cannot unwind by unreconciled field.", path))?;
    let catalog = ctx.catalog;
    for id in &property.nodes {
        for ancestor in catalog.lineage(*id) {
            ctx.authorize(ancestor, false)?;
            let node = catalog.node(ancestor);
            if node.group_reader || node.is_virtual {
                return Err(CompileError::invalid(
                    format!(
                        "Unwinding cannot occur on properties not backed by concrete data ({})",
                        node.fqpp
                    ),
                    path,
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::options::CompilerOptions;
    use crate::schema::{AccessLevel, Catalog};
    use crate::stage::testing::{context, fixture};

    fn run(options: &CompilerOptions, value: Value) -> Result<StageOutput> {
        let schema = fixture();
        let catalog = Catalog::new(&schema);
        let ctx = context(&catalog, options, StageKind::Unwind, false);
        compile(&value, &ctx)
    }

    fn failed(value: Value) -> CompileError {
        run(&CompilerOptions::new("c_pet"), value).unwrap_err()
    }

    #[test]
    fn test_unwind_shapes() {
        let options = CompilerOptions::new("c_pet");
        for value in [json!("c_tags"), json!({"path": "c_tags"}), json!(r#"{"path": "c_tags"}"#)] {
            let out = run(&options, value).unwrap();
            assert_eq!(out.json, json!({"$unwind": {"path": "$c_tags"}}));
        }
        let out = run(&options, json!("c_visits")).unwrap();
        assert_eq!(out.json, json!({"$unwind": {"path": "$c_visits"}}));
    }

    #[test]
    fn test_unwound_property_is_scalar() {
        let out = run(&CompilerOptions::new("c_pet"), json!("c_tags")).unwrap();
        let property = find_property(&out.properties, "c_tags").unwrap();
        assert_eq!(property.is_array, Some(false));
        assert_eq!(property.nodes.len(), 1);
    }

    #[test]
    fn test_invalid_unwinds() {
        assert_eq!(
            failed(json!({"path": "c_tags", "includeArrayIndex": "i"})).reason(),
            "Unwinding must consist of a single path component"
        );
        assert_eq!(failed(json!({"field": "c_tags"})).reason(), "Invalid unwind property.");
        assert_eq!(failed(json!({"path": "$c_tags"})).reason(), "Invalid $unwind property name: ($c_tags)");
        assert_eq!(failed(json!({"path": 1})).reason(), "$unwind property must be a property name");
        assert_eq!(failed(json!([1])).reason(), "Object expected for $unwind expression");
    }

    #[test]
    fn test_unbacked_paths() {
        let err = failed(json!("c_virtual"));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            err.reason(),
            "Unwinding cannot occur on properties not backed by concrete data (c_pet.c_virtual)"
        );

        let err = failed(json!("c_missing"));
        assert_eq!(err.reason(), "strict: there are no properties that could be unwound.");
        let relaxed = CompilerOptions::new("c_pet").with_strict(false);
        assert!(run(&relaxed, json!("c_missing")).is_ok());
    }

    #[test]
    fn test_unwind_does_not_raise_access() {
        let schema = fixture();
        let catalog = Catalog::new(&schema);
        let options = CompilerOptions::new("c_pet");
        let ctx = context(&catalog, &options, StageKind::Unwind, false);
        compile(&json!("c_secret"), &ctx).unwrap();
        assert_eq!(ctx.required_access.get(), AccessLevel::None);
    }

    #[test]
    fn test_variable_path() {
        let options = CompilerOptions::new("c_pet").with_variables(true);
        let out = run(&options, json!({"path": "{{field}}"})).unwrap();
        assert_eq!(out.json, json!({"$unwind": {"path": "{{field}}"}}));
        assert_eq!(out.variables, vec!["field".to_string()]);
    }
}
