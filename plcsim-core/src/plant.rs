//! Plant provisioning - creates the device nodes in the address space.

use crate::device::{Device, DeviceKind, BAROMETER_VALUE};
use crate::error::CoreError;
use crate::registry::DeviceRegistry;
use plcsim_space::{MemorySpace, NodeId, Variant};
use serde::{Deserialize, Serialize};

/// Namespace URI of the plant's device nodes.
pub const PLANT_NAMESPACE: &str = "urn:plcsim:plant";

/// One device in a plant layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Numeric identifier within the plant namespace.
    pub id: u32,
    pub browse_name: String,
    pub kind: DeviceKind,
}

impl DeviceSpec {
    pub fn new(id: u32, browse_name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id,
            browse_name: browse_name.into(),
            kind,
        }
    }
}

/// Devices to create at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantLayout {
    pub namespace_uri: String,
    pub devices: Vec<DeviceSpec>,
}

impl PlantLayout {
    /// Two valves, two vacuum pumps and one barometer.
    pub fn standard() -> Self {
        Self {
            namespace_uri: PLANT_NAMESPACE.to_string(),
            devices: vec![
                DeviceSpec::new(1001, "valve01", DeviceKind::Valve),
                DeviceSpec::new(1002, "valve02", DeviceKind::Valve),
                DeviceSpec::new(1003, "vacuumpump01", DeviceKind::VacuumPump),
                DeviceSpec::new(1004, "vacuumpump02", DeviceKind::VacuumPump),
                DeviceSpec::new(1005, "barometer01", DeviceKind::Barometer),
            ],
        }
    }
}

impl Default for PlantLayout {
    fn default() -> Self {
        Self::standard()
    }
}

/// Plant provisioning.
pub struct Plant;

impl Plant {
    /// Creates every device of `layout` under the Objects folder and registers it.
    ///
    /// Barometers start with `ambient_pressure` as their reading.
    pub fn provision(
        space: &MemorySpace,
        registry: &DeviceRegistry,
        layout: &PlantLayout,
        ambient_pressure: f64,
    ) -> Result<Vec<Device>, CoreError> {
        let namespace = space.register_namespace(&layout.namespace_uri);
        let mut devices = Vec::with_capacity(layout.devices.len());

        for spec in &layout.devices {
            let id = space.add_object(
                &NodeId::OBJECTS_FOLDER,
                NodeId::new(namespace, spec.id),
                &spec.browse_name,
                Some(spec.kind.type_definition()),
            )?;

            for (attribute, initial) in spec.kind.attributes() {
                space.add_attribute(&id, attribute, initial)?;
            }
            if spec.kind == DeviceKind::Barometer {
                space.add_attribute(&id, BAROMETER_VALUE, Variant::Float(ambient_pressure))?;
            }

            let device = registry.resolve(space, &id)?;
            tracing::debug!("Provisioned {} {}", device.kind, device);
            devices.push(device);
        }

        tracing::info!(
            "Provisioned {} devices in namespace {} ({})",
            devices.len(),
            namespace,
            layout.namespace_uri
        );
        Ok(devices)
    }
}
