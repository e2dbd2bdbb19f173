//! Cluster topology types.

use serde::{Deserialize, Serialize};

/// Number of hash slots in a cluster.
pub const NUM_SLOTS: u16 = 16384;

/// An inclusive range of hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRange {
    /// First slot in the range.
    pub start: u16,
    /// Last slot in the range (inclusive).
    pub end: u16,
}

impl SlotRange {
    /// Create a new range.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Whether the slot falls inside this range.
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// One cluster member as reported by `CLUSTER SLOTS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// `host:port` the node serves on.
    pub addr: String,
    /// Node id, empty if the server did not report one.
    pub id: String,
    /// Slot ranges this node serves. Empty for replicas.
    pub slots: Vec<SlotRange>,
    /// For a replica, the address of its primary.
    pub replica_of: Option<String>,
}

impl Node {
    /// Whether this node is a primary.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.replica_of.is_none()
    }

    /// Whether this node serves the slot.
    #[must_use]
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|r| r.contains(slot))
    }
}

/// A snapshot of the cluster's slot→node mapping.
///
/// Nodes are fully ordered: primaries first, in slot order, each directly
/// followed by its replicas. The snapshot is immutable; the router swaps in
/// a fresh one on every sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    nodes: Vec<Node>,
}

impl Topology {
    /// Build a topology from an already-ordered node list.
    #[must_use]
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// All nodes, primaries before their replicas.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Primaries only, in slot order.
    pub fn primaries(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_primary())
    }

    /// Address of the primary serving the slot.
    #[must_use]
    pub fn addr_for_slot(&self, slot: u16) -> Option<&str> {
        self.primaries()
            .find(|n| n.owns_slot(slot))
            .map(|n| n.addr.as_str())
    }

    /// Addresses of every node in the snapshot.
    pub fn addrs(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.addr.as_str())
    }

    /// Whether the snapshot holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
