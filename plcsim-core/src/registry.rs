//! Device registry.

use crate::device::{Device, DeviceKind};
use crate::error::CoreError;
use dashmap::DashMap;
use plcsim_space::{AddressSpace, NodeId};

/// Devices known to the plant, indexed by id and by browse name.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<NodeId, Device>,
    names: DashMap<String, NodeId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device, replacing any previous entry with the same id.
    pub fn register(&self, device: Device) {
        self.names.insert(device.browse_name.clone(), device.id);
        self.devices.insert(device.id, device);
    }

    /// Resolves a node into a device through its type definition and registers it.
    pub fn resolve(&self, space: &dyn AddressSpace, id: &NodeId) -> Result<Device, CoreError> {
        let info = space.get_node(id)?;
        let kind = info
            .type_definition
            .as_ref()
            .and_then(DeviceKind::from_type_definition)
            .ok_or(CoreError::UnknownDeviceType {
                node: *id,
                type_definition: info.type_definition,
            })?;

        let device = Device::new(*id, info.browse_name, kind);
        self.register(device.clone());
        Ok(device)
    }

    /// Gets a device by id.
    pub fn get(&self, id: &NodeId) -> Result<Device, CoreError> {
        self.devices
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| CoreError::DeviceNotFound {
                device: id.to_string(),
            })
    }

    /// Gets a device by browse name.
    pub fn by_name(&self, browse_name: &str) -> Result<Device, CoreError> {
        let id = self
            .names
            .get(browse_name)
            .map(|r| *r)
            .ok_or_else(|| CoreError::DeviceNotFound {
                device: browse_name.to_string(),
            })?;
        self.get(&id)
    }

    /// Resolves either a node id string or a browse name.
    pub fn lookup(&self, name_or_id: &str) -> Result<Device, CoreError> {
        match name_or_id.parse::<NodeId>() {
            Ok(id) => self.get(&id),
            Err(_) => self.by_name(name_or_id),
        }
    }

    /// Returns all devices ordered by id.
    pub fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|r| r.value().clone()).collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    /// Returns all devices of one kind ordered by id.
    pub fn of_kind(&self, kind: DeviceKind) -> Vec<Device> {
        self.all().into_iter().filter(|d| d.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plcsim_space::MemorySpace;

    #[test]
    fn test_resolve_from_type_definition() {
        let space = MemorySpace::default();
        let id = space
            .add_object(
                &NodeId::OBJECTS_FOLDER,
                NodeId::new(1, 10),
                "valve01",
                Some(DeviceKind::Valve.type_definition()),
            )
            .unwrap();

        let registry = DeviceRegistry::new();
        let device = registry.resolve(&space, &id).unwrap();
        assert_eq!(device.kind, DeviceKind::Valve);
        assert_eq!(registry.by_name("valve01").unwrap().id, id);
        assert_eq!(registry.lookup("ns=1;i=10").unwrap().browse_name, "valve01");
    }

    #[test]
    fn test_resolve_untyped_node_fails() {
        let space = MemorySpace::default();
        let id = space
            .add_object(&NodeId::OBJECTS_FOLDER, NodeId::new(1, 11), "folder", None)
            .unwrap();

        let registry = DeviceRegistry::new();
        let err = registry.resolve(&space, &id).unwrap_err();
        assert!(matches!(err, CoreError::UnknownDeviceType { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_of_kind_is_ordered() {
        let registry = DeviceRegistry::new();
        registry.register(Device::new(NodeId::new(1, 3), "v3", DeviceKind::Valve));
        registry.register(Device::new(NodeId::new(1, 1), "v1", DeviceKind::Valve));
        registry.register(Device::new(NodeId::new(1, 2), "p", DeviceKind::VacuumPump));

        let valves: Vec<_> = registry
            .of_kind(DeviceKind::Valve)
            .into_iter()
            .map(|d| d.browse_name)
            .collect();
        assert_eq!(valves, vec!["v1", "v3"]);
        assert!(matches!(
            registry.lookup("missing"),
            Err(CoreError::DeviceNotFound { .. })
        ));
    }
}
