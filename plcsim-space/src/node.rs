//! Node identifiers and attribute values.

use crate::error::SpaceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric node identifier, rendered as `ns=<namespace>;i=<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    pub namespace: u16,
    pub id: u32,
}

impl NodeId {
    /// The standard Objects folder (`ns=0;i=85`).
    pub const OBJECTS_FOLDER: NodeId = NodeId::new(0, 85);

    pub const fn new(namespace: u16, id: u32) -> Self {
        Self { namespace, id }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};i={}", self.namespace, self.id)
    }
}

impl FromStr for NodeId {
    type Err = SpaceError;

    /// Parses `ns=<namespace>;i=<id>`; a bare `i=<id>` lives in namespace 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SpaceError::InvalidNodeId(s.to_string());
        let s_trim = s.trim();

        let (namespace, ident) = match s_trim.split_once(';') {
            Some((ns, ident)) => {
                let ns = ns.strip_prefix("ns=").ok_or_else(invalid)?;
                (ns.parse::<u16>().map_err(|_| invalid())?, ident)
            }
            None => (0, s_trim),
        };

        let id = ident
            .strip_prefix("i=")
            .ok_or_else(invalid)?
            .parse::<u32>()
            .map_err(|_| invalid())?;

        Ok(Self { namespace, id })
    }
}

impl TryFrom<String> for NodeId {
    type Error = SpaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_string()
    }
}

/// An attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Variant {
    /// Parses command-line input: numbers become numeric variants, anything else a string.
    pub fn parse_lossy(s: &str) -> Self {
        if let Ok(i) = s.parse::<i64>() {
            Variant::Int(i)
        } else if let Ok(f) = s.parse::<f64>() {
            Variant::Float(f)
        } else if let Ok(b) = s.parse::<bool>() {
            Variant::Bool(b)
        } else {
            Variant::String(s.to_string())
        }
    }

    /// Name of the variant type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Bool(_) => "bool",
            Variant::Int(_) => "int",
            Variant::Float(_) => "float",
            Variant::String(_) => "string",
        }
    }

    /// Numeric value as float (ints widen).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Int(i) => Some(*i as f64),
            Variant::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Converts `self` to the type of `existing`, widening ints to floats.
    ///
    /// Returns `None` when the kinds are incompatible.
    pub(crate) fn coerce_like(self, existing: &Variant) -> Option<Variant> {
        match (existing, self) {
            (Variant::Float(_), Variant::Int(i)) => Some(Variant::Float(i as f64)),
            (Variant::Bool(_), v @ Variant::Bool(_))
            | (Variant::Int(_), v @ Variant::Int(_))
            | (Variant::Float(_), v @ Variant::Float(_))
            | (Variant::String(_), v @ Variant::String(_)) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Bool(b) => write!(f, "{b}"),
            Variant::Int(i) => write!(f, "{i}"),
            Variant::Float(v) => write!(f, "{v}"),
            Variant::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v as i64)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}
