// queryforge-core/src/schema/acl.rs
// Read authorization seam

use super::{Model, SchemaNode};
use crate::error::{CompileError, Result};
use serde::{Deserialize, Serialize};

/// Access levels, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    None,
    Public,
    Connected,
    Read,
    Share,
    Update,
    Delete,
    Script,
    System,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Public => "public",
            AccessLevel::Connected => "connected",
            AccessLevel::Read => "read",
            AccessLevel::Share => "share",
            AccessLevel::Update => "update",
            AccessLevel::Delete => "delete",
            AccessLevel::Script => "script",
            AccessLevel::System => "system",
        }
    }
}

/// Property-level acl entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "level")]
pub enum NodeAcl {
    /// Entries targeting the calling principal; the level they require
    Targeted(AccessLevel),
    /// Entries that depend on the document being read
    NonTargeted,
}

/// Decides whether the calling principal may read a property.
///
/// Only called for nodes carrying their own acl entries; other nodes are
/// covered by the pipeline-wide access level the compile reports.
pub trait AccessPolicy {
    fn authorize(&self, model: &Model, node: &SchemaNode, required: AccessLevel) -> Result<()>;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _model: &Model, _node: &SchemaNode, _required: AccessLevel) -> Result<()> {
        Ok(())
    }
}

/// A principal holding a fixed access level
#[derive(Debug, Clone, Copy)]
pub struct PrincipalAccess {
    pub level: AccessLevel,
}

impl PrincipalAccess {
    pub fn new(level: AccessLevel) -> Self {
        PrincipalAccess { level }
    }
}

impl AccessPolicy for PrincipalAccess {
    fn authorize(&self, _model: &Model, node: &SchemaNode, required: AccessLevel) -> Result<()> {
        if self.level >= required {
            Ok(())
        } else {
            Err(CompileError::access_denied(
                format!("inaccessibleProperty: {}", node.fqpp),
                node.fullpath.clone(),
            ))
        }
    }
}
