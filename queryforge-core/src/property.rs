// queryforge-core/src/property.rs
//! Candidate properties and candidate model set algebra
//!
//! A candidate property pairs a normalized path with every schema node that
//! could realize it across the surviving models. Conjunctions intersect node
//! lists, disjunctions union them; ordering follows first appearance so the
//! emitted JSON stays stable.

use crate::error::{CompileError, Result};
use crate::schema::{ModelId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateProperty {
    pub path: String,
    pub nodes: Vec<NodeId>,
    /// Unwound arrays are narrowed to `Some(false)`; `None` means "as stored"
    pub is_array: Option<bool>,
}

impl CandidateProperty {
    pub fn new(path: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        CandidateProperty {
            path: path.into(),
            nodes,
            is_array: None,
        }
    }

    pub fn with_array(mut self, is_array: Option<bool>) -> Self {
        self.is_array = is_array;
        self
    }

    /// Same nodes regardless of order
    pub fn nodes_equal(&self, nodes: &[NodeId]) -> bool {
        self.nodes.len() == nodes.len() && nodes.iter().all(|n| self.nodes.contains(n))
    }

    fn check_compatible(&self, other: &CandidateProperty) -> Result<()> {
        if self.path != other.path {
            return Err(CompileError::unsupported(
                "property intersections can only be made on identical paths",
                self.path.clone(),
            ));
        }
        if self.is_array != other.is_array {
            return Err(CompileError::unsupported(
                "mismatched property array setting in unsupported",
                self.path.clone(),
            ));
        }
        Ok(())
    }

    pub fn intersection(&self, other: &CandidateProperty) -> Result<CandidateProperty> {
        self.check_compatible(other)?;
        if self.nodes_equal(&other.nodes) {
            return Ok(self.clone());
        }
        let nodes = self
            .nodes
            .iter()
            .filter(|n| other.nodes.contains(n))
            .copied()
            .collect();
        Ok(CandidateProperty {
            path: self.path.clone(),
            nodes,
            is_array: self.is_array,
        })
    }

    pub fn union(&self, other: &CandidateProperty) -> Result<CandidateProperty> {
        self.check_compatible(other)?;
        if self.nodes_equal(&other.nodes) {
            return Ok(self.clone());
        }
        let mut nodes = self.nodes.clone();
        for n in &other.nodes {
            if !nodes.contains(n) {
                nodes.push(*n);
            }
        }
        Ok(CandidateProperty {
            path: self.path.clone(),
            nodes,
            is_array: self.is_array,
        })
    }
}

/// Look up a property by path
pub fn find_property<'a>(properties: &'a [CandidateProperty], path: &str) -> Option<&'a CandidateProperty> {
    properties.iter().find(|p| p.path == path)
}

fn merge_with<F>(groups: Vec<Vec<CandidateProperty>>, combine: F) -> Result<Vec<CandidateProperty>>
where
    F: Fn(&CandidateProperty, &CandidateProperty) -> Result<CandidateProperty>,
{
    let mut result: Vec<CandidateProperty> = Vec::new();
    for group in groups {
        for property in group {
            match result.iter().position(|p| p.path == property.path) {
                None => result.push(property),
                Some(pos) => {
                    let merged = combine(&result[pos], &property)?;
                    result[pos] = merged;
                }
            }
        }
    }
    Ok(result)
}

/// Merge property lists by path, unioning the nodes of shared paths
pub fn merge_and_union(groups: Vec<Vec<CandidateProperty>>) -> Result<Vec<CandidateProperty>> {
    merge_with(groups, |a, b| a.union(b))
}

/// Merge property lists by path, intersecting the nodes of shared paths
pub fn merge_and_intersect(groups: Vec<Vec<CandidateProperty>>) -> Result<Vec<CandidateProperty>> {
    merge_with(groups, |a, b| a.intersection(b))
}

/// Models present in every list
pub fn intersect_models(groups: &[Vec<ModelId>]) -> Vec<ModelId> {
    let mut iter = groups.iter();
    let first = match iter.next() {
        Some(first) => first.clone(),
        None => return Vec::new(),
    };
    iter.fold(first, |acc, group| {
        acc.into_iter().filter(|m| group.contains(m)).collect()
    })
}

/// Models present in any list, in first-seen order
pub fn union_models(groups: &[Vec<ModelId>]) -> Vec<ModelId> {
    let mut out: Vec<ModelId> = Vec::new();
    for group in groups {
        for m in group {
            if !out.contains(m) {
                out.push(*m);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn prop(path: &str, nodes: &[usize]) -> CandidateProperty {
        CandidateProperty::new(path, nodes.iter().map(|n| NodeId(*n)).collect())
    }

    #[test]
    fn test_intersection_and_union_keep_order() {
        let a = prop("c_x", &[3, 1, 2]);
        let b = prop("c_x", &[2, 3, 5]);
        assert_eq!(a.intersection(&b).unwrap().nodes, vec![NodeId(3), NodeId(2)]);
        assert_eq!(
            a.union(&b).unwrap().nodes,
            vec![NodeId(3), NodeId(1), NodeId(2), NodeId(5)]
        );
    }

    #[test]
    fn test_equal_node_sets_short_circuit() {
        let a = prop("c_x", &[1, 2]);
        let b = prop("c_x", &[2, 1]);
        assert_eq!(a.intersection(&b).unwrap(), a);
    }

    #[test]
    fn test_incompatible_properties() {
        let err = prop("c_x", &[1]).union(&prop("c_y", &[1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let unwound = prop("c_x", &[1]).with_array(Some(false));
        let err = prop("c_x", &[1]).intersection(&unwound).unwrap_err();
        assert_eq!(err.reason(), "mismatched property array setting in unsupported");
    }

    #[test]
    fn test_merge_by_path() {
        let merged = merge_and_intersect(vec![
            vec![prop("c_x", &[1, 2]), prop("c_y", &[4])],
            vec![prop("c_x", &[2])],
        ])
        .unwrap();
        assert_eq!(merged, vec![prop("c_x", &[2]), prop("c_y", &[4])]);

        let merged = merge_and_union(vec![vec![prop("c_x", &[1])], vec![prop("c_x", &[2])]]).unwrap();
        assert_eq!(merged, vec![prop("c_x", &[1, 2])]);
    }

    #[test]
    fn test_model_set_algebra() {
        let a = vec![ModelId(0), ModelId(1), ModelId(2)];
        let b = vec![ModelId(2), ModelId(1)];
        assert_eq!(intersect_models(&[a.clone(), b.clone()]), vec![ModelId(1), ModelId(2)]);
        assert_eq!(union_models(&[b, a]), vec![ModelId(2), ModelId(1), ModelId(0)]);
        assert!(intersect_models(&[]).is_empty());
    }
}
