//! Clients this node serves.
//!
//! Unlike the routing table, entries are unordered and several entries may
//! share a `node_id` over distinct connections (a client reconnecting
//! through a second association during bootstrap). A client is admissible
//! only while it is closer to the local id than the boundary of the close
//! group.

use crate::common::{NodeId, NodeInfo};
use crate::{Error, Result};

#[derive(Debug)]
pub struct ClientTable {
    local_id: NodeId,
    capacity: usize,
    clients: Vec<NodeInfo>,
}

impl ClientTable {
    pub fn new(local_id: NodeId, capacity: usize) -> Self {
        Self {
            local_id,
            capacity,
            clients: Vec::new(),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.clients.iter().any(|client| client.node_id == *node_id)
    }

    pub fn contains_connection(&self, connection_id: &NodeId) -> bool {
        self.clients
            .iter()
            .any(|client| client.connection_id == *connection_id)
    }

    // === Public Methods ===

    /// Admissibility without insertion: the candidate must be closer to the
    /// local id than `furthest_close_id`, the boundary of the close group.
    pub fn check_client(&self, candidate: &NodeInfo, furthest_close_id: &NodeId) -> bool {
        if candidate.node_id.is_zero() || candidate.node_id == self.local_id {
            return false;
        }
        if self.contains_connection(&candidate.connection_id) {
            return false;
        }
        if self.clients.len() >= self.capacity {
            return false;
        }

        candidate.node_id == *furthest_close_id
            || NodeId::closer_to_target(&candidate.node_id, furthest_close_id, &self.local_id)
    }

    pub fn add(&mut self, client: NodeInfo, furthest_close_id: &NodeId) -> Result<()> {
        if self.contains_connection(&client.connection_id) {
            return Err(Error::DuplicateEntry);
        }
        if !self.check_client(&client, furthest_close_id) {
            return Err(Error::CapacityReached);
        }
        self.clients.push(client);
        Ok(())
    }

    /// Drop every entry for the given node id, handing back the removed
    /// records so their associations can be torn down.
    pub fn remove(&mut self, node_id: &NodeId) -> Vec<NodeInfo> {
        let mut removed = Vec::new();
        self.clients.retain(|client| {
            if client.node_id == *node_id {
                removed.push(client.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn remove_connection(&mut self, connection_id: &NodeId) -> Option<NodeInfo> {
        let index = self
            .clients
            .iter()
            .position(|client| client.connection_id == *connection_id)?;
        Some(self.clients.remove(index))
    }
}
