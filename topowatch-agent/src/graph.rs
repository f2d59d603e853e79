//! Topology graph collaborator
//!
//! Probes never own graph entries: they add, update and retract nodes and
//! edges by key. The storage engine behind [`Graph`] is not this crate's
//! concern; [`MemoryGraph`] is a concurrent in-process implementation used by
//! the agent runtime and the tests.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Node and edge metadata
pub type Metadata = BTreeMap<String, String>;

/// Lookup key of a graph node
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup key of a graph edge
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EdgeKey(String);

impl EdgeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the `relation` edge from `parent` to `child`
    pub fn between(parent: &NodeKey, child: &NodeKey, relation: &str) -> Self {
        Self(format!("{}-{}->{}", parent, relation, child))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: NodeKey,
    pub metadata: Metadata,
}

impl Node {
    pub fn new(key: NodeKey, metadata: Metadata) -> Self {
        Self { key, metadata }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub key: EdgeKey,
    pub parent: NodeKey,
    pub child: NodeKey,
    pub metadata: Metadata,
}

/// Mutation and lookup API the probes consume
pub trait Graph: Send + Sync {
    fn add_or_update_node(&self, node: Node);

    fn add_or_update_edge(&self, edge: Edge);

    fn remove_node(&self, key: &NodeKey) -> Option<Node>;

    fn remove_edge(&self, key: &EdgeKey) -> Option<Edge>;

    fn node(&self, key: &NodeKey) -> Option<Node>;

    fn edge(&self, key: &EdgeKey) -> Option<Edge>;
}

/// Thread-safe in-memory graph
#[derive(Clone, Default)]
pub struct MemoryGraph {
    nodes: Arc<DashMap<NodeKey, Node>>,
    edges: Arc<DashMap<EdgeKey, Edge>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Snapshot of all node keys (for debugging and tests)
    pub fn node_keys(&self) -> Vec<NodeKey> {
        let mut keys: Vec<_> = self.nodes.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl Graph for MemoryGraph {
    fn add_or_update_node(&self, node: Node) {
        self.nodes.insert(node.key.clone(), node);
    }

    fn add_or_update_edge(&self, edge: Edge) {
        self.edges.insert(edge.key.clone(), edge);
    }

    fn remove_node(&self, key: &NodeKey) -> Option<Node> {
        let removed = self.nodes.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            // Incident edges cannot outlive their endpoints
            self.edges
                .retain(|_, edge| &edge.parent != key && &edge.child != key);
        }
        removed
    }

    fn remove_edge(&self, key: &EdgeKey) -> Option<Edge> {
        self.edges.remove(key).map(|(_, v)| v)
    }

    fn node(&self, key: &NodeKey) -> Option<Node> {
        self.nodes.get(key).map(|r| r.clone())
    }

    fn edge(&self, key: &EdgeKey) -> Option<Edge> {
        self.edges.get(key).map(|r| r.clone())
    }
}
