// queryforge-core/src/lib.rs
// Schema-aware compiler from the restricted aggregation language to native pipelines

pub mod error;
pub mod limits;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod property;
pub mod regex_cache;
pub mod rules;
pub mod schema;
pub mod stage;
pub mod tree;
pub mod value_utils;

// Public exports
pub use error::{CompileError, ErrorKind, Result};
pub use logging::{get_log_level, init_from_env, set_log_level, LogLevel};
pub use options::CompilerOptions;
pub use pipeline::{CompiledPipeline, CompiledStage, PipelineCompiler};
pub use schema::{
    AccessLevel, AccessPolicy, AllowAll, IndexCatalog, IndexDefinition, PrincipalAccess, Schema, TypeName,
};
pub use stage::{Expansion, StageKind};
