//! The server-peer routing table.
//!
//! A bounded collection of peers kept sorted by XOR distance from the
//! local id, closest first. Admission is proximity-monotone: once the
//! table is full a candidate gets in only by being strictly closer than
//! the current farthest entry, which it then displaces.

use tracing::trace;

use crate::common::{NodeId, NodeInfo};
use crate::{Error, Result};

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    capacity: usize,
    /// Sorted by distance from `local_id`, closest first.
    nodes: Vec<NodeInfo>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, capacity: usize) -> Self {
        Self {
            local_id,
            capacity,
            nodes: Vec::with_capacity(capacity),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.iter().any(|node| node.node_id == *node_id)
    }

    pub fn contains_connection(&self, connection_id: &NodeId) -> bool {
        self.nodes
            .iter()
            .any(|node| node.connection_id == *connection_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    // === Public Methods ===

    /// Admissibility without insertion. Pure; never retries.
    pub fn check_node(&self, candidate: &NodeInfo) -> bool {
        if candidate.node_id.is_zero() || candidate.node_id == self.local_id {
            return false;
        }
        if self.contains(&candidate.node_id) || self.contains_connection(&candidate.connection_id) {
            return false;
        }
        if self.nodes.len() < self.capacity {
            return true;
        }

        // Full table: only a strict improvement over the farthest entry.
        match self.nodes.last() {
            Some(farthest) => NodeId::closer_to_target(
                &candidate.node_id,
                &farthest.node_id,
                &self.local_id,
            ),
            None => true,
        }
    }

    /// Insert the peer at its distance rank, displacing the farthest entry
    /// if the table was full.
    pub fn add(&mut self, node: NodeInfo) -> Result<()> {
        if self.contains(&node.node_id) {
            return Err(Error::DuplicateEntry);
        }
        if !self.check_node(&node) {
            return Err(Error::CapacityReached);
        }

        let rank = self
            .nodes
            .binary_search_by(|probe| {
                probe
                    .node_id
                    .cmp_distance(&node.node_id, &self.local_id)
            })
            .unwrap_err();
        self.nodes.insert(rank, node);

        if self.nodes.len() > self.capacity {
            let evicted = self.nodes.pop();
            trace!(evicted = ?evicted.map(|n| n.node_id), "displaced farthest peer");
        }

        Ok(())
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let index = self.nodes.iter().position(|node| node.node_id == *node_id)?;
        Some(self.nodes.remove(index))
    }

    /// The `count` ids closest to `target`, strictly XOR-ordered, without
    /// the local id (which is never in the table).
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|node| node.node_id).collect();
        ids.sort_by(|a, b| a.cmp_distance(b, target));
        ids.truncate(count);
        ids
    }

    /// The `n`-th closest entry to `target`, 1-indexed. With fewer than `n`
    /// entries this is the farthest available one.
    pub fn nth_closest(&self, target: &NodeId, n: usize) -> Option<&NodeInfo> {
        if n == 0 || self.nodes.is_empty() {
            return None;
        }

        let mut refs: Vec<&NodeInfo> = self.nodes.iter().collect();
        refs.sort_by(|a, b| a.node_id.cmp_distance(&b.node_id, target));
        Some(refs[n.min(refs.len()) - 1])
    }
}
