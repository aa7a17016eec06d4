// queryforge-core/src/regex_cache.rs
//! Regular expression literals in the query language
//!
//! Patterns arrive as `/body/flags` strings. They are validated once at parse
//! time, kept in the tree as `{"$regex": body, "$options": flags}` and compiled
//! on demand (object and type name narrowing) through a small LRU cache.

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::num::NonZeroUsize;

// ============================================================================
// COMPILED PATTERN CACHE
// ============================================================================

lazy_static! {
    /// Key format: "pattern:options"
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap()));
    static ref SLASHED: Regex = Regex::new(r"^/(.*)/([a-z]*)$").unwrap();
}

/// A validated regular expression literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRegex {
    pub pattern: String,
    pub options: String,
}

impl QueryRegex {
    /// Parse `/body/flags`. Returns None when the literal is malformed or does
    /// not compile.
    pub fn parse(literal: &str) -> Option<QueryRegex> {
        let caps = SLASHED.captures(literal)?;
        let regex = QueryRegex {
            pattern: caps.get(1)?.as_str().to_string(),
            options: caps.get(2)?.as_str().to_string(),
        };
        regex.compile()?;
        Some(regex)
    }

    /// Recognise the in-tree representation
    pub fn from_value(value: &Value) -> Option<QueryRegex> {
        let map = value.as_object()?;
        if map.len() > 2 {
            return None;
        }
        let pattern = map.get("$regex")?.as_str()?;
        let options = match map.get("$options") {
            Some(Value::String(options)) => options.as_str(),
            None => "",
            Some(_) => return None,
        };
        Some(QueryRegex {
            pattern: pattern.to_string(),
            options: options.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({ "$regex": self.pattern, "$options": self.options })
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.compile().map_or(false, |regex| regex.is_match(haystack))
    }

    fn compile(&self) -> Option<Regex> {
        get_or_compile_regex(&self.pattern, &self.options)
    }
}

/// Converts query options (i, m, s, x) to inline flags; g, u and y carry no
/// meaning for matching and are dropped.
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Option<Regex> {
    let cache_key = format!("{}:{}", pattern, options);
    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Some(regex.clone());
    }
    let regex = Regex::new(&build_regex_pattern(pattern, options)).ok()?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Some(regex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slashed_literal() {
        let regex = QueryRegex::parse("/^c_ca/i").unwrap();
        assert_eq!(regex.pattern, "^c_ca");
        assert_eq!(regex.options, "i");
        assert!(regex.is_match("C_CAT"));
        assert!(!regex.is_match("c_dog"));
    }

    #[test]
    fn test_rejects_malformed_literals() {
        assert!(QueryRegex::parse("^abc").is_none());
        assert!(QueryRegex::parse("/(unclosed/").is_none());
    }

    #[test]
    fn test_value_round_trip() {
        let regex = QueryRegex::parse("/a.c/").unwrap();
        assert_eq!(QueryRegex::from_value(&regex.to_value()), Some(regex));
        assert!(QueryRegex::from_value(&json!({"$regex": 1})).is_none());
    }
}
