//! # plcsim-core
//!
//! Device engine for plcsim.
//!
//! This crate provides:
//! - Device kinds and their discrete statuses
//! - Timed valve transitions and barometer read-out loops
//! - Canned sensor series
//! - Plant provisioning and the device registry

pub mod controller;
pub mod device;
pub mod error;
pub mod plant;
pub mod registry;
pub mod series;

pub use controller::{CommandOutcome, ControllerConfig, DeviceCommands, DeviceController};
pub use device::{Device, DeviceKind, DeviceStatus};
pub use error::CoreError;
pub use plant::{DeviceSpec, Plant, PlantLayout};
pub use registry::DeviceRegistry;
pub use series::SeriesCatalog;

/// Default valve settle time, in ticks.
pub const DEFAULT_VALVE_SETTLE_TICKS: u32 = 3;
