//! Property-based tests for scalar stage bounds and match value handling.

mod schema_helpers;

use proptest::prelude::*;
use schema_helpers::*;
use serde_json::json;

// ============================================================================
// Test Strategies
// ============================================================================

/// Strategy: distinct integer match values, within the $in cap
fn in_values_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::btree_set(-1_000_000i64..1_000_000, 1..64).prop_map(|set| set.into_iter().collect())
}

// ============================================================================
// $limit / $skip bounds
// ============================================================================

proptest! {
    /// Any limit in range compiles to itself, as a number or a numeric string.
    #[test]
    fn prop_limit_in_range(n in 1u64..=500_000, as_text in any::<bool>()) {
        let value = if as_text { json!(n.to_string()) } else { json!(n) };
        let out = compile(plain_options(), json!([{"$limit": value}])).unwrap();
        prop_assert_eq!(out.build(), &json!([{"$limit": n}]));
    }

    /// Limits above the cap are rejected unless limits are relaxed.
    #[test]
    fn prop_limit_above_cap(n in 500_001u64..100_000_000) {
        let err = compile(plain_options(), json!([{"$limit": n}])).unwrap_err();
        prop_assert_eq!(
            err.reason(),
            "limit query option must be an integer between 1 and 500000, inclusive"
        );

        let relaxed = plain_options().with_relax_limits(true);
        let out = compile(relaxed, json!([{"$limit": n}])).unwrap();
        prop_assert_eq!(out.build(), &json!([{"$limit": n}]));
    }

    /// Negative skips never compile.
    #[test]
    fn prop_negative_skip(n in i64::MIN / 2..0) {
        let err = compile(plain_options(), json!([{"$skip": n}])).unwrap_err();
        prop_assert!(err.reason().starts_with("skip query option must be an integer"));
    }

    /// Fractional values are not integers, whatever their magnitude.
    #[test]
    fn prop_fractional_limit(n in 1u32..500_000, frac in 0.01f64..0.99) {
        let value = n as f64 + frac;
        let result = compile(plain_options(), json!([{"$limit": value}]));
        prop_assert!(result.is_err());
    }
}

// ============================================================================
// Match values
// ============================================================================

proptest! {
    /// $in lists pass through in order without losing members.
    #[test]
    fn prop_in_values_are_preserved(values in in_values_strategy()) {
        let out = compile(plain_options(), json!([{"$match": {"c_age": {"$in": values.clone()}}}])).unwrap();
        prop_assert_eq!(&out.stages[0].json, &json!({"$match": {"c_age": {"$in": values}}}));
    }

    /// Each $or branch survives compilation, and the compile is stable.
    #[test]
    fn prop_or_branches_survive(bounds in prop::collection::btree_set(-1000i64..1000, 2..8)) {
        let branches: Vec<_> = bounds.iter().map(|b| json!({"c_age": {"$gt": b}})).collect();
        let pipeline = json!([{"$match": {"$or": branches.clone()}}]);
        let first = compile(plain_options(), pipeline.clone()).unwrap();
        let second = compile(plain_options(), pipeline).unwrap();
        prop_assert_eq!(&first.stages[0].json, &json!({"$match": {"$or": branches}}));
        prop_assert_eq!(first.build(), second.build());
    }
}
