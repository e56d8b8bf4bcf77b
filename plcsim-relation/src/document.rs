//! Relation file document model.
//!
//! ```json
//! { "relations": [
//!   { "node_id": "ns=1;i=1002", "browse_name": "valve02",
//!     "children": [ { "node_id": "ns=1;i=1004", "browse_name": "vacuumpump02" } ] } ] }
//! ```

use plcsim_space::NodeId;
use serde::{Deserialize, Serialize};

/// Root of a relation file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationDocument {
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
}

/// A parent device and its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub node_id: NodeId,
    pub browse_name: String,
    #[serde(default)]
    pub children: Vec<ChildRecord>,
}

/// A child entry of a relation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub node_id: NodeId,
    pub browse_name: String,
}

impl RelationDocument {
    /// Number of parent/child entries, duplicates included.
    pub fn edge_count(&self) -> usize {
        self.relations.iter().map(|r| r.children.len()).sum()
    }
}
