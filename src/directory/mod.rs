//! The node's in-memory view of the overlay.
//!
//! One [`NodeDirectory`] bundles the local identity, the routing table of
//! server peers, the table of clients this node serves and the handshake
//! ledger. Callers serialize every mutation behind a single lock and must
//! not hold that lock across transport calls: decide under the lock,
//! release, talk to the network, re-acquire to mutate.

mod client_table;
mod pending;
mod routing_table;

pub use client_table::ClientTable;
pub use pending::{PendingPeer, PendingPeers, Role, Stage};
pub use routing_table::RoutingTable;

use std::time::Duration;

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::debug;

use crate::common::{NodeId, NodeInfo};
use crate::config::Config;
use crate::{Error, Result};

pub struct NodeDirectory {
    keys: SigningKey,
    local_id: NodeId,
    connection_id: NodeId,
    client_mode: bool,
    config: Config,
    routing: RoutingTable,
    clients: ClientTable,
    pending: PendingPeers,
    /// A client node's cached view of its own close group.
    close_group: Vec<NodeId>,
}

impl NodeDirectory {
    pub fn new(config: Config, keys: SigningKey, local_id: NodeId, client_mode: bool) -> Self {
        let connection_id = NodeId::random();
        Self {
            routing: RoutingTable::new(local_id, config.max_routing_table_size),
            clients: ClientTable::new(local_id, config.max_client_table_size),
            pending: PendingPeers::new(),
            close_group: Vec::new(),
            keys,
            local_id,
            connection_id,
            client_mode,
            config,
        }
    }

    // === Getters ===

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn connection_id(&self) -> NodeId {
        self.connection_id
    }

    pub fn keys(&self) -> &SigningKey {
        &self.keys
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.keys.verifying_key()
    }

    pub fn client_mode(&self) -> bool {
        self.client_mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of server peers currently routed to.
    pub fn len(&self) -> usize {
        self.routing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routing.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// True when the id is in either table.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.routing.contains(node_id) || self.clients.contains(node_id)
    }

    // === Admission checks ===

    pub fn check_node(&self, candidate: &NodeInfo) -> bool {
        !self.clients.contains(&candidate.node_id) && self.routing.check_node(candidate)
    }

    pub fn check_client(&self, candidate: &NodeInfo, furthest_close_id: &NodeId) -> bool {
        !self.routing.contains(&candidate.node_id)
            && self.clients.check_client(candidate, furthest_close_id)
    }

    /// The boundary of the close group: the id of the
    /// `closest_nodes_size`-th closest server peer, or the far end of the
    /// id space while the table is still too small to have one.
    pub fn furthest_close_id(&self) -> NodeId {
        self.routing
            .nth_closest(&self.local_id, self.config.closest_nodes_size)
            .map(|node| node.node_id)
            .unwrap_or(NodeId::MAX)
    }

    // === Closest queries ===

    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeId> {
        self.routing.closest_nodes(target, count)
    }

    pub fn nth_closest(&self, target: &NodeId, n: usize) -> Option<NodeInfo> {
        self.routing.nth_closest(target, n).cloned()
    }

    /// The local close group: ids of the `closest_nodes_size` nearest
    /// server peers.
    pub fn close_nodes(&self) -> Vec<NodeId> {
        self.routing
            .closest_nodes(&self.local_id, self.config.closest_nodes_size)
    }

    // === Pending lifecycle ===

    pub fn add_pending(&mut self, info: NodeInfo, role: Role, stage: Stage) {
        self.pending.insert(info, role, stage);
    }

    pub fn pending(&self, node_id: &NodeId) -> Option<&PendingPeer> {
        self.pending.get(node_id)
    }

    pub fn pending_contains(&self, node_id: &NodeId) -> bool {
        self.pending.contains(node_id)
    }

    pub fn drop_pending(&mut self, node_id: &NodeId) -> Option<PendingPeer> {
        self.pending.remove(node_id)
    }

    pub fn note_key_validated(&mut self, node_id: &NodeId, key: VerifyingKey) -> bool {
        self.pending.note_key_validated(node_id, key)
    }

    pub fn note_success_sent(&mut self, node_id: &NodeId) -> bool {
        self.pending.note_success_sent(node_id)
    }

    pub fn note_transport_reserved(&mut self, node_id: &NodeId) -> bool {
        self.pending.note_transport_reserved(node_id)
    }

    pub fn note_responder_confirmed(&mut self, node_id: &NodeId) -> bool {
        self.pending.note_responder_confirmed(node_id)
    }

    pub fn update_pending_info(&mut self, info: NodeInfo) -> bool {
        self.pending.update_info(info)
    }

    /// Record that the peer's acknowledgement arrived before local key
    /// validation completed, stashing its close-group hints for later.
    pub fn note_peer_acknowledged(&mut self, node_id: &NodeId, close_ids: Vec<NodeId>) -> bool {
        match self.pending.get_mut(node_id) {
            Some(entry) => {
                entry.peer_acknowledged = true;
                entry.hinted_close_ids = close_ids;
                true
            }
            None => false,
        }
    }

    /// Promote a pending peer into its table. Requires the key gate to have
    /// passed; re-promoting an already tabled peer is a no-op.
    pub fn confirm_pending(&mut self, node_id: &NodeId) -> Result<NodeInfo> {
        let entry = self.pending.remove(node_id).ok_or(Error::NotFound)?;

        if entry.info.public_key.is_none() {
            debug!(peer = %node_id, "refusing to promote unvalidated peer");
            return Err(Error::ValidationFailure);
        }

        if self.contains(node_id) {
            // Another path already admitted this peer.
            return Ok(entry.info);
        }

        if entry.info.is_client {
            let boundary = self.furthest_close_id();
            self.clients.add(entry.info.clone(), &boundary)?;
        } else {
            self.routing.add(entry.info.clone())?;
        }

        debug!(
            peer = %node_id,
            client = entry.info.is_client,
            table_size = self.routing.len(),
            "peer acknowledged"
        );
        Ok(entry.info)
    }

    /// Drain pending entries older than `ttl`; the caller tears down their
    /// transport associations outside the lock.
    pub fn expire_pending(&mut self, ttl: Duration) -> Vec<PendingPeer> {
        self.pending.expire(ttl)
    }

    // === Removal ===

    /// Remove the peer from whichever table holds it, returning the
    /// connection ids whose associations should be dropped.
    pub fn remove_node(&mut self, node_id: &NodeId) -> Vec<NodeId> {
        let mut connections = Vec::new();
        if let Some(info) = self.routing.remove(node_id) {
            connections.push(info.connection_id);
        }
        for info in self.clients.remove(node_id) {
            connections.push(info.connection_id);
        }
        connections
    }

    // === Client close group ===

    pub fn close_group(&self) -> &[NodeId] {
        &self.close_group
    }

    /// Replace the cached close group, returning the previous membership.
    pub fn set_close_group(&mut self, group: Vec<NodeId>) -> Vec<NodeId> {
        std::mem::replace(&mut self.close_group, group)
    }
}
