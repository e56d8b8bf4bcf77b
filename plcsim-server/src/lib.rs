//! # plcsim-server
//!
//! Simulation runtime for plcsim.
//!
//! This crate provides:
//! - Data-change subscription dispatch
//! - Cascading of device commands along the relation graph
//! - Evacuate/intake orchestration under a single-flight guard
//! - The control surface used by the CLI
//! - Configuration loading

pub mod cascade;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod sequencer;
pub mod simulator;

pub use cascade::{CascadeHandler, CascadeParams, CascadeRule, CascadeRules};
pub use config::{
    Config, ConfigError, DispatcherConfig, PlantConfig, RelationsConfig, SequenceProfile,
    SequencerConfig,
};
pub use dispatcher::{DataChangeHandler, SubscriptionDispatcher};
pub use error::ServerError;
pub use handler::{ControlSurface, DeviceSummary};
pub use sequencer::{
    SequenceGuard, SequenceKind, SequenceLease, SequenceOutcome, SequenceReport, Sequencer,
    TriggerOutcome,
};
pub use simulator::Simulator;
