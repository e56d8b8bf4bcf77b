//! # plcsim-relation
//!
//! Device relation graph for plcsim.
//!
//! This crate provides:
//! - A forest of parent/child device relations with an id index
//! - The relation file document model
//! - Relation file persistence

pub mod document;
pub mod error;
pub mod graph;
pub mod store;

pub use document::{ChildRecord, RelationDocument, RelationRecord};
pub use error::RelationError;
pub use graph::{RelationGraph, RelationNode};
pub use store::RelationStore;
