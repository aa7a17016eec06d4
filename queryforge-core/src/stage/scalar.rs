// queryforge-core/src/stage/scalar.rs
// `$limit` and `$skip`: bounded integers, or variables

use super::{StageContext, StageKind, StageOutput};
use crate::error::{CompileError, Result};
use crate::limits::{MAX_LIMIT, MAX_SKIP};
use crate::value_utils::as_integer;
use serde_json::{json, Value};

/// Compile a `$limit` or `$skip` stage value
pub fn compile(value: &Value, ctx: &StageContext<'_, '_>) -> Result<StageOutput> {
    let key = ctx.kind.key();
    if let Some(name) = ctx.variable(value) {
        let mut out = StageOutput::passthrough(json!({ key: format!("{{{{{}}}}}", name) }), ctx);
        out.variables.push(name);
        return Ok(out);
    }

    let (min, max, default_max) = match ctx.kind {
        StageKind::Limit => (1, ctx.limits.max_limit, MAX_LIMIT),
        _ => (0, ctx.limits.max_skip, MAX_SKIP),
    };
    let out_of_range = || {
        let name = if ctx.kind == StageKind::Limit { "limit" } else { "skip" };
        let upper = max.unwrap_or(default_max);
        let reason = if max.is_some() {
            format!("{} query option must be an integer between {} and {}, inclusive", name, min, upper)
        } else {
            format!("{} query option must be an integer greater than or equal to {}", name, min)
        };
        CompileError::invalid(reason, key)
    };

    // "10" is accepted the way every other stage accepts JSON strings
    let parsed = match value {
        Value::String(s) => serde_json::from_str::<Value>(s).map_err(|_| out_of_range())?,
        other => other.clone(),
    };
    let n = as_integer(&parsed).ok_or_else(out_of_range)?;
    if n < min || max.map_or(false, |max| n > max) {
        return Err(out_of_range());
    }
    Ok(StageOutput::passthrough(json!({ key: n }), ctx))
}
