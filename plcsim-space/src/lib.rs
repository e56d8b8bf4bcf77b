//! # plcsim-space
//!
//! Address-space capability for plcsim.
//!
//! This crate provides:
//! - Node identifiers in `ns=<index>;i=<id>` form
//! - Attribute values (`Variant`)
//! - The `AddressSpace` trait the plant consumes
//! - `MemorySpace`, an in-memory address space with data-change notifications

pub mod error;
pub mod memory;
pub mod node;
pub mod space;

pub use error::SpaceError;
pub use memory::MemorySpace;
pub use node::{NodeId, Variant};
pub use space::{AddressSpace, DataChange, NodeInfo, SubscriptionHandle};

/// Namespace URI registered at index 0.
pub const STANDARD_NAMESPACE: &str = "http://opcfoundation.org/UA/";
