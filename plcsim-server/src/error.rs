//! Server error types.

use crate::config::ConfigError;
use plcsim_space::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("address space error: {0}")]
    Space(#[from] plcsim_space::SpaceError),

    #[error("device error: {0}")]
    Core(#[from] plcsim_core::CoreError),

    #[error("relation error: {0}")]
    Relation(#[from] plcsim_relation::RelationError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("already subscribed to {attribute} on {node}")]
    AlreadySubscribed { node: NodeId, attribute: String },

    #[error("no subscription to {attribute} on {node}")]
    SubscriptionNotFound { node: NodeId, attribute: String },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl ServerError {
    /// Returns an error code suitable for command responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Space(e) => e.error_code(),
            ServerError::Core(e) => e.error_code(),
            ServerError::Relation(e) => e.error_code(),
            ServerError::Config(_) => "CONFIG_ERROR",
            ServerError::AlreadySubscribed { .. } => "ALREADY_SUBSCRIBED",
            ServerError::SubscriptionNotFound { .. } => "SUBSCRIPTION_NOT_FOUND",
            ServerError::Timeout { .. } => "TIMEOUT",
            ServerError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            ServerError::InvalidRequest(_) => "BAD_REQUEST",
            ServerError::TaskFailed(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        self.error_code().ends_with("NOT_FOUND")
    }
}
