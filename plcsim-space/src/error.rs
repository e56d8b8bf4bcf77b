//! Address-space error types.

use crate::node::NodeId;
use thiserror::Error;

/// Errors from address-space lookups and writes.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node already exists: {0}")]
    NodeExists(NodeId),

    #[error("child '{browse_name}' not found under {parent}")]
    ChildNotFound { parent: NodeId, browse_name: String },

    #[error("attribute '{attribute}' not found on {node}")]
    AttributeNotFound { node: NodeId, attribute: String },

    #[error("type mismatch on {node}.{attribute}: expected {expected}, got {actual}")]
    TypeMismatch {
        node: NodeId,
        attribute: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),
}

impl SpaceError {
    /// Returns an error code suitable for command responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            SpaceError::NodeNotFound(_) => "NODE_NOT_FOUND",
            SpaceError::NodeExists(_) => "NODE_EXISTS",
            SpaceError::ChildNotFound { .. } => "NODE_NOT_FOUND",
            SpaceError::AttributeNotFound { .. } => "ATTRIBUTE_NOT_FOUND",
            SpaceError::TypeMismatch { .. } => "BAD_REQUEST",
            SpaceError::InvalidNodeId(_) => "BAD_REQUEST",
        }
    }

    /// Returns true if the error means the addressed node or attribute is missing.
    pub fn is_not_found(&self) -> bool {
        self.error_code().ends_with("NOT_FOUND")
    }
}
