//! Relation error types.

use plcsim_space::NodeId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the relation graph and its store.
#[derive(Debug, Error)]
pub enum RelationError {
    #[error("node not found in relation graph: {node}")]
    NotFound { node: NodeId },

    #[error("{child} already has parent {parent}")]
    AlreadyHasParent { child: NodeId, parent: NodeId },

    #[error("relation {parent} -> {child} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },

    #[error("node {node} is named '{existing}', not '{given}'")]
    NameMismatch {
        node: NodeId,
        existing: String,
        given: String,
    },

    #[error("relation file not found: {}", .0.display())]
    ConfigurationMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelationError {
    /// Returns an error code suitable for command responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            RelationError::NotFound { .. } => "NODE_NOT_FOUND",
            RelationError::AlreadyHasParent { .. } => "RELATION_CONFLICT",
            RelationError::Cycle { .. } => "RELATION_CONFLICT",
            RelationError::NameMismatch { .. } => "RELATION_CONFLICT",
            RelationError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            RelationError::Io(_) => "IO_ERROR",
            RelationError::Json(_) => "BAD_REQUEST",
        }
    }

    /// Returns true for edges rejected to keep the graph a forest.
    pub fn is_conflict(&self) -> bool {
        self.error_code() == "RELATION_CONFLICT"
    }
}
