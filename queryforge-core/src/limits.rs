// queryforge-core/src/limits.rs
// Structural bounds and name patterns

use lazy_static::lazy_static;
use regex::Regex;

pub const MAX_STAGES: usize = 20;
pub const MAX_EXPRESSION_DEPTH: usize = 20;
pub const MAX_EXPRESSION_KEYS: usize = 100;
pub const MAX_IN_ELEMENTS: usize = 10_000;
pub const MAX_ALL_ELEMENTS: usize = 10_000;
pub const MAX_LOGICAL_CONDITIONS: usize = 100;
pub const MAX_REGEXP_LENGTH: usize = 255;
pub const MAX_SKIP: i64 = 500_000;
pub const MAX_LIMIT: i64 = 500_000;

pub const FIELD_NAME_PATTERN: &str = "^[a-zA-Z0-9-_]{1,40}$";

lazy_static! {
    pub static ref FIELD_NAME_REGEX: Regex = Regex::new(FIELD_NAME_PATTERN).unwrap();
    pub static ref FIELD_PATH_REGEX: Regex =
        Regex::new(r"^[a-zA-Z0-9-_]{1,40}(\.[a-zA-Z0-9-_]{1,40})*$").unwrap();
    pub static ref VARIABLE_REGEX: Regex =
        Regex::new(r"^\{\{([a-zA-Z0-9-_.]{1,100})\}\}$").unwrap();
}

/// Effective caps for one compile. `None` means the cap is lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_stages: Option<usize>,
    pub max_expression_depth: Option<usize>,
    pub max_expression_keys: Option<usize>,
    pub max_in_elements: Option<usize>,
    pub max_all_elements: Option<usize>,
    pub max_logical_conditions: Option<usize>,
    pub max_regexp_length: Option<usize>,
    pub max_skip: Option<i64>,
    pub max_limit: Option<i64>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_stages: Some(MAX_STAGES),
            max_expression_depth: Some(MAX_EXPRESSION_DEPTH),
            max_expression_keys: Some(MAX_EXPRESSION_KEYS),
            max_in_elements: Some(MAX_IN_ELEMENTS),
            max_all_elements: Some(MAX_ALL_ELEMENTS),
            max_logical_conditions: Some(MAX_LOGICAL_CONDITIONS),
            max_regexp_length: Some(MAX_REGEXP_LENGTH),
            max_skip: Some(MAX_SKIP),
            max_limit: Some(MAX_LIMIT),
        }
    }
}

impl Limits {
    pub fn relaxed() -> Self {
        Limits {
            max_stages: None,
            max_expression_depth: None,
            max_expression_keys: None,
            max_in_elements: None,
            max_all_elements: None,
            max_logical_conditions: None,
            max_regexp_length: None,
            max_skip: None,
            max_limit: None,
        }
    }

    pub fn for_relax(relax: bool) -> Self {
        if relax {
            Limits::relaxed()
        } else {
            Limits::default()
        }
    }
}

/// True when `count` exceeds an active cap
#[inline]
pub fn exceeds(cap: Option<usize>, count: usize) -> bool {
    cap.map_or(false, |max| count > max)
}

/// Name of the `{{variable}}` placeholder, if `value` is one
pub fn variable_name(value: &str) -> Option<&str> {
    VARIABLE_REGEX
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_name_regex() {
        assert!(FIELD_NAME_REGEX.is_match("c_name"));
        assert!(FIELD_NAME_REGEX.is_match("a-b_9"));
        assert!(!FIELD_NAME_REGEX.is_match("c.name"));
        assert!(!FIELD_NAME_REGEX.is_match("$sum"));
        assert!(!FIELD_NAME_REGEX.is_match(&"a".repeat(41)));
    }

    #[test]
    fn test_field_path_regex() {
        assert!(FIELD_PATH_REGEX.is_match("c_doc.c_name"));
        assert!(!FIELD_PATH_REGEX.is_match("c_doc..c_name"));
        assert!(!FIELD_PATH_REGEX.is_match("c_doc.$gt"));
    }

    #[test]
    fn test_variable_name() {
        assert_eq!(variable_name("{{user.name}}"), Some("user.name"));
        assert_eq!(variable_name("{{}}"), None);
        assert_eq!(variable_name("user"), None);
    }

    #[test]
    fn test_relaxed_lifts_caps() {
        let relaxed = Limits::for_relax(true);
        assert!(!exceeds(relaxed.max_in_elements, MAX_IN_ELEMENTS + 1));
        let strict = Limits::for_relax(false);
        assert!(!exceeds(strict.max_in_elements, MAX_IN_ELEMENTS));
        assert!(exceeds(strict.max_in_elements, MAX_IN_ELEMENTS + 1));
    }
}
