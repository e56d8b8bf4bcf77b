//! Relation graph - a forest of devices keyed by node id.
//!
//! Nodes live in an arena and refer to each other by index; an id index gives
//! O(1) lookup. Every node has at most one parent, so the graph is always a
//! forest. Nodes are created lazily on first sighting of their id.

use crate::document::{ChildRecord, RelationDocument, RelationRecord};
use crate::error::RelationError;
use plcsim_space::NodeId;
use std::collections::HashMap;

/// A device in the relation graph.
#[derive(Debug, Clone)]
pub struct RelationNode {
    pub id: NodeId,
    pub browse_name: String,
    children: Vec<usize>,
    parent: Option<usize>,
}

impl RelationNode {
    fn new(id: NodeId, browse_name: &str) -> Self {
        Self {
            id,
            browse_name: browse_name.to_string(),
            children: Vec::new(),
            parent: None,
        }
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// Parent/child relations between devices.
#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    nodes: Vec<RelationNode>,
    index: HashMap<NodeId, usize>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from a relation document.
    ///
    /// Entries that would break the forest are logged and skipped.
    pub fn from_document(document: &RelationDocument) -> Self {
        let mut graph = Self::new();

        for record in &document.relations {
            if let Err(e) = graph.add_node(record.node_id, &record.browse_name) {
                tracing::warn!("Skipping relation record {}: {}", record.node_id, e);
                continue;
            }
            for child in &record.children {
                let parent = (record.node_id, record.browse_name.as_str());
                let child_key = (child.node_id, child.browse_name.as_str());
                if let Err(e) = graph.add_edge(parent, child_key) {
                    tracing::warn!(
                        "Skipping relation {} -> {}: {}",
                        record.node_id,
                        child.node_id,
                        e
                    );
                }
            }
        }

        tracing::debug!(
            "Built relation graph: {} nodes, {} roots",
            graph.len(),
            graph.roots().len()
        );
        graph
    }

    /// Adds a node if its id is new. A known id must carry the same browse name.
    pub fn add_node(&mut self, id: NodeId, browse_name: &str) -> Result<(), RelationError> {
        self.check_name(id, browse_name)?;
        self.ensure_node(id, browse_name);
        Ok(())
    }

    /// Adds a parent -> child edge.
    ///
    /// Returns `Ok(false)` if the exact edge (ids and browse names) already
    /// exists. Fails if the child already has another parent or the edge
    /// would close a cycle.
    pub fn add_edge(
        &mut self,
        parent: (NodeId, &str),
        child: (NodeId, &str),
    ) -> Result<bool, RelationError> {
        let (parent_id, parent_name) = parent;
        let (child_id, child_name) = child;

        self.check_name(parent_id, parent_name)?;
        self.check_name(child_id, child_name)?;

        if parent_id == child_id {
            return Err(RelationError::Cycle {
                parent: parent_id,
                child: child_id,
            });
        }

        if let Some(&child_idx) = self.index.get(&child_id) {
            if let Some(existing) = self.nodes[child_idx].parent {
                let existing = self.nodes[existing].id;
                if existing == parent_id {
                    return Ok(false);
                }
                return Err(RelationError::AlreadyHasParent {
                    child: child_id,
                    parent: existing,
                });
            }

            // The child must not be an ancestor of the parent.
            let mut cursor = self.index.get(&parent_id).copied();
            while let Some(idx) = cursor {
                if idx == child_idx {
                    return Err(RelationError::Cycle {
                        parent: parent_id,
                        child: child_id,
                    });
                }
                cursor = self.nodes[idx].parent;
            }
        }

        let parent_idx = self.ensure_node(parent_id, parent_name);
        let child_idx = self.ensure_node(child_id, child_name);
        self.nodes[parent_idx].children.push(child_idx);
        self.nodes[child_idx].parent = Some(parent_idx);

        tracing::debug!(
            "Added relation {} ({}) -> {} ({})",
            parent_name,
            parent_id,
            child_name,
            child_id
        );
        Ok(true)
    }

    /// Finds a node by id.
    pub fn find(&self, id: &NodeId) -> Result<&RelationNode, RelationError> {
        self.index
            .get(id)
            .map(|&idx| &self.nodes[idx])
            .ok_or(RelationError::NotFound { node: *id })
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the children of a node in insertion order.
    pub fn children(&self, id: &NodeId) -> Result<Vec<&RelationNode>, RelationError> {
        let node = self.find(id)?;
        Ok(node.children.iter().map(|&idx| &self.nodes[idx]).collect())
    }

    /// Returns the parent of a node, if any.
    pub fn parent(&self, id: &NodeId) -> Result<Option<&RelationNode>, RelationError> {
        let node = self.find(id)?;
        Ok(node.parent.map(|idx| &self.nodes[idx]))
    }

    /// Returns the nodes without a parent, in insertion order.
    pub fn roots(&self) -> Vec<&RelationNode> {
        self.nodes.iter().filter(|n| n.parent.is_none()).collect()
    }

    /// Returns every (parent, child) edge.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.nodes
            .iter()
            .flat_map(|n| n.children.iter().map(move |&c| (n.id, self.nodes[c].id)))
            .collect()
    }

    /// Renders the graph as a relation document.
    ///
    /// Every node with children gets a record; isolated roots get an empty one.
    pub fn to_document(&self) -> RelationDocument {
        let relations = self
            .nodes
            .iter()
            .filter(|n| !n.children.is_empty() || n.parent.is_none())
            .map(|n| RelationRecord {
                node_id: n.id,
                browse_name: n.browse_name.clone(),
                children: n
                    .children
                    .iter()
                    .map(|&c| ChildRecord {
                        node_id: self.nodes[c].id,
                        browse_name: self.nodes[c].browse_name.clone(),
                    })
                    .collect(),
            })
            .collect();

        RelationDocument { relations }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn check_name(&self, id: NodeId, browse_name: &str) -> Result<(), RelationError> {
        match self.index.get(&id) {
            Some(&idx) if self.nodes[idx].browse_name != browse_name => {
                Err(RelationError::NameMismatch {
                    node: id,
                    existing: self.nodes[idx].browse_name.clone(),
                    given: browse_name.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn ensure_node(&mut self, id: NodeId, browse_name: &str) -> usize {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(RelationNode::new(id, browse_name));
        self.index.insert(id, idx);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId::new(1, id)
    }

    fn sample() -> RelationGraph {
        let mut graph = RelationGraph::new();
        graph.add_edge((n(5), "valve02"), (n(9), "vacuumpump02")).unwrap();
        graph.add_edge((n(5), "valve02"), (n(6), "valve03")).unwrap();
        graph.add_edge((n(7), "barometer01"), (n(8), "vacuumpump01")).unwrap();
        graph
    }

    #[test]
    fn test_lookup() {
        let graph = sample();
        assert_eq!(graph.len(), 5);

        let children: Vec<_> = graph
            .children(&n(5))
            .unwrap()
            .into_iter()
            .map(|c| c.browse_name.as_str())
            .collect();
        assert_eq!(children, vec!["vacuumpump02", "valve03"]);

        let roots: Vec<_> = graph.roots().into_iter().map(|r| r.id).collect();
        assert_eq!(roots, vec![n(5), n(7)]);

        assert_eq!(graph.parent(&n(9)).unwrap().unwrap().id, n(5));
        assert!(graph.children(&n(9)).unwrap().is_empty());
        assert!(matches!(
            graph.find(&n(42)),
            Err(RelationError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_edge_is_silent() {
        let mut graph = sample();
        let added = graph
            .add_edge((n(5), "valve02"), (n(9), "vacuumpump02"))
            .unwrap();
        assert!(!added);
        assert_eq!(graph.children(&n(5)).unwrap().len(), 2);
        assert_eq!(graph.edges().len(), 3);
    }

    #[test]
    fn test_forest_violations_rejected() {
        let mut graph = sample();

        let err = graph
            .add_edge((n(7), "barometer01"), (n(9), "vacuumpump02"))
            .unwrap_err();
        assert!(matches!(err, RelationError::AlreadyHasParent { parent, .. } if parent == n(5)));

        let err = graph.add_edge((n(9), "vacuumpump02"), (n(5), "valve02")).unwrap_err();
        assert!(matches!(err, RelationError::Cycle { .. }));

        let err = graph.add_edge((n(1), "self"), (n(1), "self")).unwrap_err();
        assert!(matches!(err, RelationError::Cycle { .. }));
        assert!(!graph.contains(&n(1)));

        let err = graph.add_edge((n(5), "valve99"), (n(10), "x")).unwrap_err();
        assert!(matches!(err, RelationError::NameMismatch { .. }));
        assert!(!graph.contains(&n(10)));

        assert_eq!(graph.edges().len(), 3);
    }

    #[test]
    fn test_reparent_root_under_other_tree() {
        let mut graph = sample();
        assert!(graph.add_edge((n(9), "vacuumpump02"), (n(7), "barometer01")).unwrap());
        let roots: Vec<_> = graph.roots().into_iter().map(|r| r.id).collect();
        assert_eq!(roots, vec![n(5)]);
    }

    #[test]
    fn test_from_document_skips_bad_edges() {
        let document = RelationDocument {
            relations: vec![
                RelationRecord {
                    node_id: n(5),
                    browse_name: "valve02".into(),
                    children: vec![ChildRecord {
                        node_id: n(9),
                        browse_name: "vacuumpump02".into(),
                    }],
                },
                RelationRecord {
                    node_id: n(9),
                    browse_name: "vacuumpump02".into(),
                    children: vec![ChildRecord {
                        node_id: n(5),
                        browse_name: "valve02".into(),
                    }],
                },
                RelationRecord {
                    node_id: n(11),
                    browse_name: "standalone".into(),
                    children: vec![],
                },
            ],
        };

        let graph = RelationGraph::from_document(&document);
        assert_eq!(graph.edges(), vec![(n(5), n(9))]);
        assert!(graph.contains(&n(11)));
        assert_eq!(graph.roots().len(), 2);
    }

    #[test]
    fn test_document_roundtrip() {
        let graph = sample();
        let document = graph.to_document();
        assert_eq!(document.relations.len(), 2);

        let rebuilt = RelationGraph::from_document(&document);
        assert_eq!(rebuilt.edges(), graph.edges());
        assert_eq!(rebuilt.len(), graph.len());
    }
}
