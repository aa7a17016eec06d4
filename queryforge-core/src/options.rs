// queryforge-core/src/options.rs
// Compiler options: strictness, limits, index and access behaviour

use crate::limits::Limits;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_LOCALE: &str = "en_US";
pub const DEFAULT_COLLECTION: &str = "contexts";

/// Options for one compile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerOptions {
    /// Object (model family) the pipeline runs against
    pub object: String,

    /// Unresolvable candidates are hard errors
    pub strict: bool,

    /// Lift the structural caps (stages, depth, keys, array sizes, skip/limit)
    pub relax_limits: bool,

    /// Recognise `{{name}}` placeholders
    pub with_variables: bool,

    /// Restricted match operators this org may use ("*" for all)
    pub allowed_restricted_match_ops: Vec<String>,

    /// Filter every index branch is seeded with
    pub base_find: Map<String, Value>,

    pub current_locale: String,

    /// Treat every matched property as index covered
    pub unindexed: bool,

    /// Never consider the pipeline index-eligible
    pub skip_index_checks: bool,

    pub allow_system_access: bool,

    /// Collection consulted for native index definitions
    pub collection: String,

    /// Internal stages prepended ahead of the caller's pipeline. They bypass acl checks.
    pub pre_match: Option<Value>,
    pub pre_sort: Option<Value>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            object: String::new(),
            strict: true,
            relax_limits: false,
            with_variables: false,
            allowed_restricted_match_ops: Vec::new(),
            base_find: Map::new(),
            current_locale: DEFAULT_LOCALE.to_string(),
            unindexed: false,
            skip_index_checks: false,
            allow_system_access: false,
            collection: DEFAULT_COLLECTION.to_string(),
            pre_match: None,
            pre_sort: None,
        }
    }
}

impl CompilerOptions {
    pub fn new(object: impl Into<String>) -> Self {
        CompilerOptions {
            object: object.into(),
            ..Self::default()
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_relax_limits(mut self, relax: bool) -> Self {
        self.relax_limits = relax;
        self
    }

    pub fn with_variables(mut self, enabled: bool) -> Self {
        self.with_variables = enabled;
        self
    }

    pub fn with_base_find(mut self, base_find: Map<String, Value>) -> Self {
        self.base_find = base_find;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.current_locale = locale.into();
        self
    }

    pub fn with_allowed_restricted_ops<I, S>(mut self, ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_restricted_match_ops = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unindexed(mut self, unindexed: bool) -> Self {
        self.unindexed = unindexed;
        self
    }

    pub fn with_skip_index_checks(mut self, skip: bool) -> Self {
        self.skip_index_checks = skip;
        self
    }

    pub fn with_system_access(mut self, allow: bool) -> Self {
        self.allow_system_access = allow;
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_pre_match(mut self, pre_match: Value) -> Self {
        self.pre_match = Some(pre_match);
        self
    }

    pub fn with_pre_sort(mut self, pre_sort: Value) -> Self {
        self.pre_sort = Some(pre_sort);
        self
    }

    pub fn limits(&self) -> Limits {
        Limits::for_relax(self.relax_limits)
    }

    pub fn is_restricted_op_allowed(&self, op: &str) -> bool {
        self.allowed_restricted_match_ops
            .iter()
            .any(|allowed| allowed == "*" || allowed == op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = CompilerOptions::default();
        assert!(options.strict);
        assert!(!options.relax_limits);
        assert_eq!(options.current_locale, "en_US");
        assert_eq!(options.collection, "contexts");
    }

    #[test]
    fn test_deserialize_camel_case() {
        let options: CompilerOptions = serde_json::from_value(json!({
            "object": "c_pet",
            "strict": false,
            "relaxLimits": true,
            "allowedRestrictedMatchOps": ["$ne"],
            "baseFind": {"org": 1}
        }))
        .unwrap();
        assert_eq!(options.object, "c_pet");
        assert!(!options.strict);
        assert!(options.relax_limits);
        assert!(options.is_restricted_op_allowed("$ne"));
        assert!(!options.is_restricted_op_allowed("$type"));
        assert_eq!(options.base_find.get("org"), Some(&json!(1)));
    }

    #[test]
    fn test_wildcard_allows_every_restricted_op() {
        let options = CompilerOptions::new("c_pet").with_allowed_restricted_ops(["*"]);
        assert!(options.is_restricted_op_allowed("$type"));
        assert!(options.is_restricted_op_allowed("$nin"));
    }
}
