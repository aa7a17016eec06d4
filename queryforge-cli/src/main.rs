use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use queryforge_core::{
    set_log_level, AccessLevel, CompilerOptions, LogLevel, PipelineCompiler, PrincipalAccess, Schema,
};
use serde_json::{json, Value};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "queryforge")]
#[command(about = "queryforge CLI - compile aggregation pipelines into native MongoDB pipelines")]
#[command(version)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a pipeline file (or stdin with "-") against a schema
    Compile {
        /// Pipeline JSON file, or "-" for stdin
        pipeline: PathBuf,
        /// Schema document (JSON)
        #[arg(long)]
        schema: PathBuf,
        /// Object the pipeline runs against
        #[arg(long)]
        object: Option<String>,
        /// Compiler options file (JSON, camelCase keys)
        #[arg(long)]
        options: Option<PathBuf>,
        /// Resolve unknown paths leniently
        #[arg(long)]
        lenient: bool,
        /// Lift stage, depth, key and skip/limit caps
        #[arg(long)]
        relax_limits: bool,
        /// Recognise {{name}} placeholders
        #[arg(long)]
        variables: bool,
        /// Locale for localized properties
        #[arg(long)]
        locale: Option<String>,
        /// Never treat the pipeline as index eligible
        #[arg(long)]
        skip_index_checks: bool,
        /// Access level of the principal checked against targeted acl entries
        #[arg(long)]
        principal: Option<String>,
        /// Print stages, required access, variables and expansions
        #[arg(long)]
        full: bool,
    },
    /// List the objects a schema defines
    Objects {
        /// Schema document (JSON)
        #[arg(long)]
        schema: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    queryforge_core::init_from_env();
    if let Some(level) = cli.log_level.as_deref() {
        let level = LogLevel::from_str(level).with_context(|| format!("Unknown log level: {}", level))?;
        set_log_level(level);
    }

    match cli.command {
        Commands::Compile {
            pipeline,
            schema,
            object,
            options,
            lenient,
            relax_limits,
            variables,
            locale,
            skip_index_checks,
            principal,
            full,
        } => {
            let mut opts = match options {
                Some(path) => load_options(&path)?,
                None => CompilerOptions::default(),
            };
            if let Some(object) = object {
                opts.object = object;
            }
            if lenient {
                opts.strict = false;
            }
            if relax_limits {
                opts.relax_limits = true;
            }
            if variables {
                opts.with_variables = true;
            }
            if let Some(locale) = locale {
                opts.current_locale = locale;
            }
            if skip_index_checks {
                opts.skip_index_checks = true;
            }
            let principal = principal.as_deref().map(parse_access_level).transpose()?;
            compile(&pipeline, &schema, opts, principal, full)
        }
        Commands::Objects { schema } => {
            let schema = load_schema(&schema)?;
            for name in schema.object_names() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn compile(
    pipeline_path: &Path,
    schema_path: &Path,
    options: CompilerOptions,
    principal: Option<AccessLevel>,
    full: bool,
) -> Result<()> {
    anyhow::ensure!(!options.object.is_empty(), "--object (or \"object\" in --options) is required");

    let schema = load_schema(schema_path)?;
    let pipeline = read_pipeline(pipeline_path)?;

    let policy = principal.map(PrincipalAccess::new);
    let mut compiler = PipelineCompiler::new(&schema, options);
    if let Some(policy) = policy.as_ref() {
        compiler = compiler.with_policy(policy);
    }
    let compiled = compiler
        .compile(&pipeline)
        .map_err(|e| anyhow::anyhow!("{}: {}", e.kind(), e))?;

    let output = if full {
        json!({
            "pipeline": compiled.build(),
            "requiredAccess": compiled.required_access,
            "variables": compiled.variables,
            "expansions": compiled.expansions,
            "usesIndex": compiled.uses_index,
            "canBeCalledAsQuery": compiled.can_be_called_as_query(),
        })
    } else {
        compiled.build().clone()
    };
    let text = serde_json::to_string_pretty(&output).with_context(|| "Failed to serialize pipeline")?;
    println!("{}", text);
    Ok(())
}

fn load_schema(path: &Path) -> Result<Schema> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read schema: {}", path.display()))?;
    Schema::from_json_str(&content).with_context(|| format!("Invalid schema in: {}", path.display()))
}

fn load_options(path: &Path) -> Result<CompilerOptions> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read options: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid options JSON in: {}", path.display()))
}

/// The pipeline is handed to the compiler as text so its own JSON errors apply
fn read_pipeline(path: &Path) -> Result<Value> {
    let content = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .with_context(|| "Failed to read pipeline from stdin")?;
        buffer
    } else {
        fs::read_to_string(path).with_context(|| format!("Failed to read pipeline: {}", path.display()))?
    };
    Ok(Value::String(content))
}

fn parse_access_level(level: &str) -> Result<AccessLevel> {
    serde_json::from_value(Value::String(level.to_lowercase()))
        .with_context(|| format!("Unknown access level: {}", level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_options_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        fs::write(&path, r#"{"object": "c_pet", "strict": false, "currentLocale": "fr_CA"}"#).unwrap();

        let options = load_options(&path).unwrap();
        assert_eq!(options.object, "c_pet");
        assert!(!options.strict);
        assert_eq!(options.current_locale, "fr_CA");
        assert!(!options.relax_limits);
    }

    #[test]
    fn test_missing_files_carry_context() {
        let err = load_schema(Path::new("/nonexistent/schema.json")).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read schema"));
    }

    #[test]
    fn test_access_levels() {
        assert_eq!(parse_access_level("Read").unwrap(), AccessLevel::Read);
        assert!(parse_access_level("root").is_err());
    }

    #[test]
    fn test_pipeline_is_read_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"[{"$limit": 1}]"#).unwrap();
        assert_eq!(read_pipeline(&path).unwrap(), json!("[{\"$limit\": 1}]"));
    }
}
