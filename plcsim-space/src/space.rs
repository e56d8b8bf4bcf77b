//! The address-space capability consumed by the plant.

use crate::error::SpaceError;
use crate::node::{NodeId, Variant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Browse information for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub browse_name: String,
    /// Type definition the node was instantiated from, if any.
    pub type_definition: Option<NodeId>,
    pub parent: Option<NodeId>,
}

/// A data-change notification for one (node, attribute) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub node: NodeId,
    pub attribute: String,
    pub value: Variant,
    pub timestamp: DateTime<Utc>,
}

/// Handle identifying a data-change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Read/write/subscribe primitives against an address space.
///
/// Implementations are internally synchronized; every call observes the
/// latest committed value.
pub trait AddressSpace: Send + Sync {
    /// Looks up a node by id.
    fn get_node(&self, id: &NodeId) -> Result<NodeInfo, SpaceError>;

    /// Resolves a direct child of `parent` by browse name.
    fn get_child(&self, parent: &NodeId, browse_name: &str) -> Result<NodeId, SpaceError>;

    /// Reads an attribute value.
    fn get_attribute(&self, node: &NodeId, attribute: &str) -> Result<Variant, SpaceError>;

    /// Writes an attribute value, notifying subscribers if the value changed.
    fn set_attribute(&self, node: &NodeId, attribute: &str, value: Variant)
        -> Result<(), SpaceError>;

    /// Registers interest in changes of one attribute.
    ///
    /// Notifications arrive on the returned receiver in the order the values changed.
    fn subscribe_data_change(
        &self,
        node: &NodeId,
        attribute: &str,
    ) -> Result<(SubscriptionHandle, broadcast::Receiver<DataChange>), SpaceError>;

    /// Releases a subscription. Returns true if it existed.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;
}
