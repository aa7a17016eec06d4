// queryforge-core/src/error.rs
// Typed, path-annotated compile errors

use std::fmt;
use thiserror::Error;

/// Every failure raised while parsing, validating or building a pipeline.
///
/// The reason is the human readable explanation; the path is the dotted
/// component path (operators included) where the violation was detected.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("{}", render(.reason, .path))]
    InvalidArgument { reason: String, path: String },

    #[error("{}", render(.reason, .path))]
    AccessDenied { reason: String, path: String },

    #[error("{}", render(.reason, .path))]
    NotFound { reason: String, path: String },

    #[error("{}", render(.reason, .path))]
    Unsupported { reason: String, path: String },

    #[error("{}", render(.reason, .path))]
    Conflict { reason: String, path: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn render(reason: &str, path: &str) -> String {
    if path.is_empty() {
        reason.to_string()
    } else {
        format!("{} ({})", reason, path)
    }
}

impl CompileError {
    pub fn invalid(reason: impl Into<String>, path: impl Into<String>) -> Self {
        CompileError::InvalidArgument {
            reason: reason.into(),
            path: path.into(),
        }
    }

    pub fn access_denied(reason: impl Into<String>, path: impl Into<String>) -> Self {
        CompileError::AccessDenied {
            reason: reason.into(),
            path: path.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>, path: impl Into<String>) -> Self {
        CompileError::NotFound {
            reason: reason.into(),
            path: path.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>, path: impl Into<String>) -> Self {
        CompileError::Unsupported {
            reason: reason.into(),
            path: path.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>, path: impl Into<String>) -> Self {
        CompileError::Conflict {
            reason: reason.into(),
            path: path.into(),
        }
    }

    /// Stable machine readable code
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompileError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            CompileError::AccessDenied { .. } => ErrorKind::AccessDenied,
            CompileError::NotFound { .. } => ErrorKind::NotFound,
            CompileError::Unsupported { .. } => ErrorKind::Unsupported,
            CompileError::Conflict { .. } => ErrorKind::Conflict,
            CompileError::Schema(_) => ErrorKind::Schema,
            CompileError::Json(_) => ErrorKind::Json,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            CompileError::InvalidArgument { reason, .. }
            | CompileError::AccessDenied { reason, .. }
            | CompileError::NotFound { reason, .. }
            | CompileError::Unsupported { reason, .. }
            | CompileError::Conflict { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            CompileError::InvalidArgument { path, .. }
            | CompileError::AccessDenied { path, .. }
            | CompileError::NotFound { path, .. }
            | CompileError::Unsupported { path, .. }
            | CompileError::Conflict { path, .. } => path,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    AccessDenied,
    NotFound,
    Unsupported,
    Conflict,
    Schema,
    Json,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Schema => "schema",
            ErrorKind::Json => "json",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_path() {
        let err = CompileError::invalid("Cannot sort by unreconciled field.", "c_missing");
        assert_eq!(err.to_string(), "Cannot sort by unreconciled field. (c_missing)");
        assert_eq!(err.path(), "c_missing");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_display_without_path() {
        let err = CompileError::conflict("double indexed expression could not be resolved.", "");
        assert_eq!(err.to_string(), "double indexed expression could not be resolved.");
        assert_eq!(err.kind().as_str(), "conflict");
    }
}
