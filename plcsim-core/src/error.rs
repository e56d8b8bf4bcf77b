//! Core error types.

use plcsim_space::{NodeId, SpaceError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the device engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("node {node} has unknown device type {type_definition:?}")]
    UnknownDeviceType {
        node: NodeId,
        type_definition: Option<NodeId>,
    },

    #[error("invalid parameter for {device}: {reason}")]
    InvalidParameter { device: String, reason: String },

    #[error("invalid status value {value} on {device}")]
    InvalidStatus { device: String, value: String },

    #[error("sensor series not found: {series}")]
    SeriesNotFound { series: String },

    #[error("failed to load series file '{path}': {reason}")]
    SeriesFile { path: PathBuf, reason: String },

    #[error("address space error: {0}")]
    Space(#[from] SpaceError),
}

impl CoreError {
    /// Returns an error code suitable for command responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            CoreError::UnknownDeviceType { .. } => "BAD_REQUEST",
            CoreError::InvalidParameter { .. } => "BAD_REQUEST",
            CoreError::InvalidStatus { .. } => "INTERNAL_ERROR",
            CoreError::SeriesNotFound { .. } => "SERIES_NOT_FOUND",
            CoreError::SeriesFile { .. } => "CONFIG_ERROR",
            CoreError::Space(e) => e.error_code(),
        }
    }
}
