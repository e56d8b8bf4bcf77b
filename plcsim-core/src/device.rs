//! Device kinds, statuses and attribute layout.

use plcsim_space::{NodeId, Variant};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device kind, resolved once from the node's type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Valve,
    VacuumPump,
    Barometer,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::Valve,
        DeviceKind::VacuumPump,
        DeviceKind::Barometer,
    ];

    /// Type definition node the kind is instantiated from.
    pub fn type_definition(&self) -> NodeId {
        match self {
            DeviceKind::Valve => NodeId::new(1, 2007),
            DeviceKind::Barometer => NodeId::new(1, 2015),
            DeviceKind::VacuumPump => NodeId::new(1, 2020),
        }
    }

    /// Resolves a kind from a type definition.
    pub fn from_type_definition(type_definition: &NodeId) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_definition() == *type_definition)
    }

    /// Attribute holding the device status.
    pub fn status_attribute(&self) -> &'static str {
        match self {
            DeviceKind::Valve => "ValveStatus",
            DeviceKind::VacuumPump => "VacuumPumpStatus",
            DeviceKind::Barometer => "BarometerStatus",
        }
    }

    /// Configuration attribute written by `start`, if any.
    pub fn config_attribute(&self) -> Option<&'static str> {
        match self {
            DeviceKind::Valve => Some(VALVE_GAS_FLOW),
            DeviceKind::VacuumPump => Some(PUMP_FREQUENCY),
            DeviceKind::Barometer => None,
        }
    }

    /// Attributes declared on a fresh device, with their initial values.
    pub fn attributes(&self) -> Vec<(&'static str, Variant)> {
        let mut attrs = vec![(self.status_attribute(), DeviceStatus::Closed.to_variant())];
        if let Some(config) = self.config_attribute() {
            attrs.push((config, Variant::Float(0.0)));
        }
        if *self == DeviceKind::Barometer {
            attrs.push((BAROMETER_VALUE, Variant::Float(0.0)));
        }
        attrs
    }

    /// Whether this kind passes through OPENING/CLOSING.
    pub fn has_transient_states(&self) -> bool {
        matches!(self, DeviceKind::Valve)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Valve => f.write_str("valve"),
            DeviceKind::VacuumPump => f.write_str("vacuum pump"),
            DeviceKind::Barometer => f.write_str("barometer"),
        }
    }
}

/// Valve gas flow configuration (L/min).
pub const VALVE_GAS_FLOW: &str = "ValveConfig.GasFlow";
/// Vacuum pump frequency configuration.
pub const PUMP_FREQUENCY: &str = "VacuumPumpConfig.FREQ";
/// Barometer pressure reading (Pa).
pub const BAROMETER_VALUE: &str = "BarometerData.Value";

/// Device status. The discriminant is the value stored in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Closed = 0,
    Open = 1,
    Closing = 2,
    Opening = 3,
}

impl DeviceStatus {
    pub fn to_variant(self) -> Variant {
        Variant::Int(self as i64)
    }

    pub fn from_variant(value: &Variant) -> Option<Self> {
        match value.as_i64()? {
            0 => Some(DeviceStatus::Closed),
            1 => Some(DeviceStatus::Open),
            2 => Some(DeviceStatus::Closing),
            3 => Some(DeviceStatus::Opening),
            _ => None,
        }
    }

    /// Returns true for OPENING and CLOSING.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceStatus::Opening | DeviceStatus::Closing)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Closed => "CLOSED",
            DeviceStatus::Open => "OPEN",
            DeviceStatus::Closing => "CLOSING",
            DeviceStatus::Opening => "OPENING",
        };
        f.write_str(s)
    }
}

/// A reference to a device in the address space.
///
/// Holds identity only; status and configuration are always read through
/// the address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: NodeId,
    pub browse_name: String,
    pub kind: DeviceKind,
}

impl Device {
    pub fn new(id: NodeId, browse_name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id,
            browse_name: browse_name.into(),
            kind,
        }
    }

    pub fn status_attribute(&self) -> &'static str {
        self.kind.status_attribute()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.browse_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_type_definition() {
        for kind in DeviceKind::ALL {
            assert_eq!(
                DeviceKind::from_type_definition(&kind.type_definition()),
                Some(kind)
            );
        }
        assert_eq!(DeviceKind::from_type_definition(&NodeId::new(1, 1)), None);
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(DeviceStatus::Closed.to_variant(), Variant::Int(0));
        assert_eq!(DeviceStatus::Opening.to_variant(), Variant::Int(3));
        assert_eq!(
            DeviceStatus::from_variant(&Variant::Int(2)),
            Some(DeviceStatus::Closing)
        );
        assert_eq!(DeviceStatus::from_variant(&Variant::Int(7)), None);
        assert_eq!(DeviceStatus::from_variant(&Variant::Float(1.0)), None);
    }

    #[test]
    fn test_barometer_attributes() {
        let names: Vec<_> = DeviceKind::Barometer
            .attributes()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["BarometerStatus", BAROMETER_VALUE]);
    }
}
