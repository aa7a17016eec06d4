// queryforge-core/src/stage/matching/operators.rs
//! `$match` operator table
//!
//! Match operators form their own namespace: `$in` here is a query operator,
//! not the pipeline expression of the same name. Each entry carries the parse
//! rules run against its raw value and whether it sits behind the org-level
//! allow-list.
//!
//! ```text
//! MatchOp
//!     ↓
//! ┌──────────────────┬────────────────┬───────────────────────┐
//! │ Comparison       │ Logical        │ Array / element       │
//! │ ($eq, $gt ...)   │ ($and, $or)    │ ($in, $all, $size ...)│
//! └──────────────────┴────────────────┴───────────────────────┘
//! ```

use crate::rules::Rule;
use ahash::AHashMap;
use lazy_static::lazy_static;
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Type,
    Exists,
    In,
    Nin,
    And,
    Or,
    Regex,
    Size,
    All,
    ElemMatch,
    Within,
}

lazy_static! {
    /// Global registry of match operators by key
    pub static ref MATCH_OPERATORS: AHashMap<&'static str, MatchOp> = {
        let mut registry = AHashMap::new();

        // Comparison operators
        registry.insert("$eq", MatchOp::Eq);
        registry.insert("$ne", MatchOp::Ne);
        registry.insert("$gt", MatchOp::Gt);
        registry.insert("$gte", MatchOp::Gte);
        registry.insert("$lt", MatchOp::Lt);
        registry.insert("$lte", MatchOp::Lte);

        // Element operators
        registry.insert("$type", MatchOp::Type);
        registry.insert("$exists", MatchOp::Exists);

        // Array operators
        registry.insert("$in", MatchOp::In);
        registry.insert("$nin", MatchOp::Nin);
        registry.insert("$all", MatchOp::All);
        registry.insert("$elemMatch", MatchOp::ElemMatch);
        registry.insert("$size", MatchOp::Size);

        // Logical operators
        registry.insert("$and", MatchOp::And);
        registry.insert("$or", MatchOp::Or);

        registry.insert("$regex", MatchOp::Regex);
        registry.insert("$within", MatchOp::Within);

        registry
    };

    /// BSON type aliases accepted by `$type`
    pub static ref ALLOWED_TYPES: BTreeSet<&'static str> = [
        "double", "string", "object", "array", "binData", "objectId", "bool", "date", "null",
        "regex", "int", "timestamp", "long", "decimal", "minKey", "maxKey",
    ]
    .into_iter()
    .collect();
}

/// `$type` aliases in declaration order, for error messages
pub const TYPE_ALIASES: &str =
    "double,string,object,array,binData,objectId,bool,date,null,regex,int,timestamp,long,decimal,minKey,maxKey";

impl MatchOp {
    pub fn lookup(key: &str) -> Option<MatchOp> {
        MATCH_OPERATORS.get(key).copied()
    }

    pub fn key(&self) -> &'static str {
        match self {
            MatchOp::Eq => "$eq",
            MatchOp::Ne => "$ne",
            MatchOp::Gt => "$gt",
            MatchOp::Gte => "$gte",
            MatchOp::Lt => "$lt",
            MatchOp::Lte => "$lte",
            MatchOp::Type => "$type",
            MatchOp::Exists => "$exists",
            MatchOp::In => "$in",
            MatchOp::Nin => "$nin",
            MatchOp::And => "$and",
            MatchOp::Or => "$or",
            MatchOp::Regex => "$regex",
            MatchOp::Size => "$size",
            MatchOp::All => "$all",
            MatchOp::ElemMatch => "$elemMatch",
            MatchOp::Within => "$within",
        }
    }

    /// Only usable when the org allow-list names it (or `*`)
    pub fn is_restricted(&self) -> bool {
        matches!(self, MatchOp::Type | MatchOp::Ne | MatchOp::Nin)
    }

    /// Structural rules run before the value is parsed
    pub fn rules(&self) -> &'static [Rule] {
        use Rule::*;
        match self {
            MatchOp::Eq | MatchOp::Ne | MatchOp::Gt => &[
                UpstreamMustBePropertyOrAllOrElemMatch,
                ValueMustBeSimpleOrPrimitiveOrEmpty,
            ],
            MatchOp::Gte | MatchOp::Lt | MatchOp::Lte => &[
                UpstreamMustBePropertyOrAllOrElemMatch,
                ValueMustBeSimpleOrPrimitive,
            ],
            MatchOp::Type | MatchOp::Exists | MatchOp::Regex => &[UpstreamMustBePropertyOrAllOrElemMatch],
            MatchOp::In | MatchOp::Nin => &[UpstreamMustBePropertyOrAllOrElemMatch, MustBeArrayOfMaxInElements],
            MatchOp::And | MatchOp::Or => &[MustBeTopLevelOrInsideLogical, MustBeArrayOfConditions],
            MatchOp::Size | MatchOp::All => &[ParentMustBeProperty],
            MatchOp::ElemMatch => &[ParentMustBePropertyOrAll],
            MatchOp::Within => &[ParentMustBeProperty, ValueMustBeObject],
        }
    }

    /// Comparison used when the operator narrows models or discriminators
    pub fn compare_op(&self) -> Option<CompareOp> {
        match self {
            MatchOp::Eq => Some(CompareOp::Eq),
            MatchOp::Ne => Some(CompareOp::Ne),
            MatchOp::Gt => Some(CompareOp::Gt),
            MatchOp::Gte => Some(CompareOp::Gte),
            MatchOp::Lt => Some(CompareOp::Lt),
            MatchOp::Lte => Some(CompareOp::Lte),
            _ => None,
        }
    }

    /// Builds through the shared single-value builder
    pub fn is_simple(&self) -> bool {
        self.compare_op().is_some() || *self == MatchOp::Exists
    }

    /// Combines array elements by intersection (`$and`, `$all`) rather than union
    pub fn is_conjunction(&self) -> bool {
        matches!(self, MatchOp::And | MatchOp::All)
    }

    /// Ancestors that shape the index entry tree
    pub fn is_logical(key: &str) -> bool {
        matches!(key, "$all" | "$and" | "$elemMatch" | "$or")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// Does `ordering` (actual vs expected) satisfy the comparison
    pub fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
        }
    }

    /// Result when exactly one side is missing (null type against a named type)
    pub fn accepts_missing(&self, both_missing: bool) -> bool {
        if both_missing {
            matches!(self, CompareOp::Eq | CompareOp::Gte | CompareOp::Lte)
        } else {
            *self == CompareOp::Ne
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        for (key, op) in MATCH_OPERATORS.iter() {
            assert_eq!(op.key(), *key);
        }
        assert_eq!(MATCH_OPERATORS.len(), 17);
        assert!(MatchOp::lookup("$nor").is_none());
        assert!(MatchOp::lookup("$expr").is_none());
    }

    #[test]
    fn test_restricted_operators() {
        let restricted: Vec<&str> = MATCH_OPERATORS
            .values()
            .filter(|op| op.is_restricted())
            .map(|op| op.key())
            .collect();
        assert_eq!(restricted.len(), 3);
        assert!(restricted.contains(&"$type"));
        assert!(restricted.contains(&"$ne"));
        assert!(restricted.contains(&"$nin"));
    }

    #[test]
    fn test_compare_ops() {
        assert!(CompareOp::Gte.accepts(Ordering::Equal));
        assert!(!CompareOp::Gt.accepts(Ordering::Equal));
        assert!(CompareOp::Lt.accepts(Ordering::Less));
        assert!(CompareOp::Ne.accepts_missing(false));
        assert!(!CompareOp::Eq.accepts_missing(false));
        assert!(CompareOp::Eq.accepts_missing(true));
    }

    #[test]
    fn test_type_aliases_match_set() {
        let listed: BTreeSet<&str> = TYPE_ALIASES.split(',').collect();
        assert_eq!(listed, *ALLOWED_TYPES);
    }
}
