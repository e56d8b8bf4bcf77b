//! In-memory address space.

use crate::error::SpaceError;
use crate::node::{NodeId, Variant};
use crate::space::{AddressSpace, DataChange, NodeInfo, SubscriptionHandle};
use crate::STANDARD_NAMESPACE;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// A stored node.
#[derive(Debug)]
struct NodeRecord {
    info: NodeInfo,
    children: Vec<NodeId>,
    attributes: BTreeMap<String, Variant>,
}

impl NodeRecord {
    fn new(info: NodeInfo) -> Self {
        Self {
            info,
            children: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }
}

/// In-memory address space with per-attribute broadcast channels.
pub struct MemorySpace {
    /// Nodes indexed by id.
    nodes: DashMap<NodeId, RwLock<NodeRecord>>,

    /// Namespace array; the index is the namespace index.
    namespaces: RwLock<Vec<String>>,

    /// Per-(node, attribute) broadcast channels.
    channels: DashMap<(NodeId, String), broadcast::Sender<DataChange>>,

    /// Subscription metadata: handle -> (node, attribute).
    subscriptions: DashMap<SubscriptionHandle, (NodeId, String)>,

    next_subscription: AtomicU64,

    /// Channel capacity.
    channel_capacity: usize,
}

impl MemorySpace {
    /// Creates an address space holding only the Objects folder.
    pub fn new(channel_capacity: usize) -> Self {
        let space = Self {
            nodes: DashMap::new(),
            namespaces: RwLock::new(vec![STANDARD_NAMESPACE.to_string()]),
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            channel_capacity,
        };

        space.nodes.insert(
            NodeId::OBJECTS_FOLDER,
            RwLock::new(NodeRecord::new(NodeInfo {
                id: NodeId::OBJECTS_FOLDER,
                browse_name: "Objects".to_string(),
                type_definition: None,
                parent: None,
            })),
        );

        space
    }

    /// Registers a namespace URI, returning its index (existing index if already present).
    pub fn register_namespace(&self, uri: &str) -> u16 {
        let mut namespaces = self.namespaces.write();
        if let Some(idx) = namespaces.iter().position(|ns| ns == uri) {
            return idx as u16;
        }
        namespaces.push(uri.to_string());
        (namespaces.len() - 1) as u16
    }

    /// Returns the namespace array.
    pub fn namespace_array(&self) -> Vec<String> {
        self.namespaces.read().clone()
    }

    /// Adds an object node under `parent`.
    pub fn add_object(
        &self,
        parent: &NodeId,
        id: NodeId,
        browse_name: &str,
        type_definition: Option<NodeId>,
    ) -> Result<NodeId, SpaceError> {
        // Sibling browse names must be unique.
        for child in self.children(parent)? {
            if self.browse_name_of(&child).as_deref() == Some(browse_name) {
                return Err(SpaceError::NodeExists(child));
            }
        }

        match self.nodes.entry(id) {
            Entry::Occupied(_) => return Err(SpaceError::NodeExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(RwLock::new(NodeRecord::new(NodeInfo {
                    id,
                    browse_name: browse_name.to_string(),
                    type_definition,
                    parent: Some(*parent),
                })));
            }
        }

        match self.nodes.get(parent) {
            Some(parent_lock) => parent_lock.write().children.push(id),
            None => {
                self.nodes.remove(&id);
                return Err(SpaceError::NodeNotFound(*parent));
            }
        }

        tracing::debug!("Added node {} '{}' under {}", id, browse_name, parent);
        Ok(id)
    }

    /// Declares an attribute with its initial value. Redeclaring overwrites silently.
    pub fn add_attribute(
        &self,
        node: &NodeId,
        attribute: &str,
        initial: Variant,
    ) -> Result<(), SpaceError> {
        let node_lock = self.nodes.get(node).ok_or(SpaceError::NodeNotFound(*node))?;
        node_lock
            .write()
            .attributes
            .insert(attribute.to_string(), initial);
        Ok(())
    }

    /// Returns the children of a node in insertion order.
    pub fn children(&self, node: &NodeId) -> Result<Vec<NodeId>, SpaceError> {
        self.nodes
            .get(node)
            .map(|r| r.read().children.clone())
            .ok_or(SpaceError::NodeNotFound(*node))
    }

    /// Returns the number of nodes, including the Objects folder.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn browse_name_of(&self, id: &NodeId) -> Option<String> {
        self.nodes.get(id).map(|r| r.read().info.browse_name.clone())
    }
}

impl Default for MemorySpace {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl AddressSpace for MemorySpace {
    fn get_node(&self, id: &NodeId) -> Result<NodeInfo, SpaceError> {
        self.nodes
            .get(id)
            .map(|r| r.read().info.clone())
            .ok_or(SpaceError::NodeNotFound(*id))
    }

    fn get_child(&self, parent: &NodeId, browse_name: &str) -> Result<NodeId, SpaceError> {
        let children = self.children(parent)?;
        children
            .into_iter()
            .find(|child| self.browse_name_of(child).as_deref() == Some(browse_name))
            .ok_or_else(|| SpaceError::ChildNotFound {
                parent: *parent,
                browse_name: browse_name.to_string(),
            })
    }

    fn get_attribute(&self, node: &NodeId, attribute: &str) -> Result<Variant, SpaceError> {
        let node_lock = self.nodes.get(node).ok_or(SpaceError::NodeNotFound(*node))?;
        let record = node_lock.read();
        record
            .attributes
            .get(attribute)
            .cloned()
            .ok_or_else(|| SpaceError::AttributeNotFound {
                node: *node,
                attribute: attribute.to_string(),
            })
    }

    fn set_attribute(
        &self,
        node: &NodeId,
        attribute: &str,
        value: Variant,
    ) -> Result<(), SpaceError> {
        let node_lock = self.nodes.get(node).ok_or(SpaceError::NodeNotFound(*node))?;

        // Notify while holding the write lock so notifications for one
        // attribute are sent in the order the values were written.
        let mut record = node_lock.write();
        let existing = record
            .attributes
            .get_mut(attribute)
            .ok_or_else(|| SpaceError::AttributeNotFound {
                node: *node,
                attribute: attribute.to_string(),
            })?;

        let actual = value.type_name();
        let value = value
            .coerce_like(existing)
            .ok_or_else(|| SpaceError::TypeMismatch {
                node: *node,
                attribute: attribute.to_string(),
                expected: existing.type_name(),
                actual,
            })?;

        if *existing == value {
            return Ok(());
        }
        *existing = value.clone();

        if let Some(sender) = self.channels.get(&(*node, attribute.to_string())) {
            // Ignore send errors (no receivers)
            let _ = sender.send(DataChange {
                node: *node,
                attribute: attribute.to_string(),
                value,
                timestamp: Utc::now(),
            });
        }

        Ok(())
    }

    fn subscribe_data_change(
        &self,
        node: &NodeId,
        attribute: &str,
    ) -> Result<(SubscriptionHandle, broadcast::Receiver<DataChange>), SpaceError> {
        // Validates both node and attribute.
        self.get_attribute(node, attribute)?;

        let handle =
            SubscriptionHandle(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        let receiver = self
            .channels
            .entry((*node, attribute.to_string()))
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();

        self.subscriptions
            .insert(handle, (*node, attribute.to_string()));

        tracing::debug!("Subscribed {} to {}.{}", handle, node, attribute);
        Ok((handle, receiver))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some((_, key)) = self.subscriptions.remove(&handle) else {
            return false;
        };

        // Drop the channel once nobody watches the pair so receivers see it closed.
        let still_watched = self.subscriptions.iter().any(|entry| *entry.value() == key);
        if !still_watched {
            self.channels.remove(&key);
        }

        tracing::debug!("Unsubscribed {} from {}.{}", handle, key.0, key.1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn space_with_valve() -> (MemorySpace, NodeId) {
        let space = MemorySpace::new(16);
        let valve = space
            .add_object(&NodeId::OBJECTS_FOLDER, NodeId::new(1, 1), "valve01", None)
            .unwrap();
        space
            .add_attribute(&valve, "ValveStatus", Variant::Int(0))
            .unwrap();
        space
            .add_attribute(&valve, "ValveConfig.GasFlow", Variant::Float(0.0))
            .unwrap();
        (space, valve)
    }

    #[test]
    fn test_browse() {
        let (space, valve) = space_with_valve();
        assert_eq!(
            space.get_child(&NodeId::OBJECTS_FOLDER, "valve01").unwrap(),
            valve
        );
        let info = space.get_node(&valve).unwrap();
        assert_eq!(info.browse_name, "valve01");
        assert_eq!(info.parent, Some(NodeId::OBJECTS_FOLDER));

        let err = space
            .get_child(&NodeId::OBJECTS_FOLDER, "valve02")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let (space, _) = space_with_valve();
        let err = space
            .add_object(&NodeId::OBJECTS_FOLDER, NodeId::new(1, 1), "other", None)
            .unwrap_err();
        assert!(matches!(err, SpaceError::NodeExists(_)));

        let err = space
            .add_object(&NodeId::OBJECTS_FOLDER, NodeId::new(1, 2), "valve01", None)
            .unwrap_err();
        assert!(matches!(err, SpaceError::NodeExists(_)));
    }

    #[test]
    fn test_attribute_read_write() {
        let (space, valve) = space_with_valve();
        space
            .set_attribute(&valve, "ValveConfig.GasFlow", Variant::Int(2))
            .unwrap();
        assert_eq!(
            space.get_attribute(&valve, "ValveConfig.GasFlow").unwrap(),
            Variant::Float(2.0)
        );

        let err = space
            .set_attribute(&valve, "ValveStatus", Variant::from("open"))
            .unwrap_err();
        assert!(matches!(err, SpaceError::TypeMismatch { .. }));

        let err = space
            .set_attribute(&valve, "Missing", Variant::Int(1))
            .unwrap_err();
        assert!(matches!(err, SpaceError::AttributeNotFound { .. }));
    }

    #[test]
    fn test_namespaces() {
        let space = MemorySpace::default();
        assert_eq!(space.register_namespace("urn:plcsim"), 1);
        assert_eq!(space.register_namespace("urn:plcsim"), 1);
        assert_eq!(space.namespace_array().len(), 2);
    }

    #[tokio::test]
    async fn test_data_change_only_on_change() {
        let (space, valve) = space_with_valve();
        let (_, mut rx) = space.subscribe_data_change(&valve, "ValveStatus").unwrap();

        space.set_attribute(&valve, "ValveStatus", Variant::Int(3)).unwrap();
        space.set_attribute(&valve, "ValveStatus", Variant::Int(3)).unwrap();
        space.set_attribute(&valve, "ValveStatus", Variant::Int(1)).unwrap();

        assert_eq!(rx.recv().await.unwrap().value, Variant::Int(3));
        assert_eq!(rx.recv().await.unwrap().value, Variant::Int(1));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let (space, valve) = space_with_valve();
        let (handle, mut rx) = space.subscribe_data_change(&valve, "ValveStatus").unwrap();
        assert_eq!(space.subscription_count(), 1);

        assert!(space.unsubscribe(handle));
        assert!(!space.unsubscribe(handle));
        assert_eq!(space.subscription_count(), 0);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn test_subscribe_unknown_attribute() {
        let (space, valve) = space_with_valve();
        assert!(space.subscribe_data_change(&valve, "Nope").is_err());
        assert!(space
            .subscribe_data_change(&NodeId::new(9, 9), "ValveStatus")
            .is_err());
    }
}
