//! The handshake ledger.
//!
//! Tracks every peer between "we exchanged connect messages" and "both
//! sides acknowledged", one state machine entry per peer. Entries age out;
//! a peer that never confirms is indistinguishable from one that refused.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;

use crate::common::{NodeId, NodeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// This node's role in the connect exchange with the peer.
pub enum Role {
    /// We sent the `ConnectRequest`.
    Requester,
    /// The peer did.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Progress of one peer through the handshake.
pub enum Stage {
    /// A `ConnectRequest` is in flight; no transport state yet.
    Dialed,
    /// The transport association is reserved.
    Pending,
    /// The peer's public key checked out.
    Validated,
    /// Our `ConnectSuccess` went out; waiting on the acknowledgement.
    SuccessSent,
}

#[derive(Debug, Clone)]
pub struct PendingPeer {
    pub info: NodeInfo,
    pub role: Role,
    pub stage: Stage,
    pub since: Instant,
    /// The peer's acknowledgement arrived before our own key validation
    /// finished; promote as soon as it does.
    pub peer_acknowledged: bool,
    /// Close-group hints delivered with an early acknowledgement.
    pub hinted_close_ids: Vec<NodeId>,
    /// The responder reported its half up before we were ready to
    /// acknowledge; do so once the key gate passes.
    pub responder_confirmed: bool,
}

#[derive(Debug, Default)]
pub struct PendingPeers {
    entries: HashMap<NodeId, PendingPeer>,
}

impl PendingPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.entries.contains_key(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&PendingPeer> {
        self.entries.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut PendingPeer> {
        self.entries.get_mut(node_id)
    }

    /// Insert an entry for the peer. Re-inserting an already tracked peer
    /// is a no-op: the ledger is a set and duplicates carry no news.
    pub fn insert(&mut self, info: NodeInfo, role: Role, stage: Stage) {
        self.entries
            .entry(info.node_id)
            .or_insert_with(|| PendingPeer {
                info,
                role,
                stage,
                since: Instant::now(),
                peer_acknowledged: false,
                hinted_close_ids: Vec::new(),
                responder_confirmed: false,
            });
    }

    /// Replace a tracked peer's contact details, keeping its validation
    /// state and handshake progress intact.
    pub fn update_info(&mut self, info: NodeInfo) -> bool {
        match self.entries.get_mut(&info.node_id) {
            Some(entry) => {
                let key = entry.info.public_key;
                entry.info = info;
                if entry.info.public_key.is_none() {
                    entry.info.public_key = key;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<PendingPeer> {
        self.entries.remove(node_id)
    }

    /// Record the validated key and advance past the key gate.
    pub fn note_key_validated(&mut self, node_id: &NodeId, key: VerifyingKey) -> bool {
        match self.entries.get_mut(node_id) {
            Some(entry) => {
                entry.info.public_key = Some(key);
                if entry.stage < Stage::Validated {
                    entry.stage = Stage::Validated;
                }
                true
            }
            None => false,
        }
    }

    pub fn note_success_sent(&mut self, node_id: &NodeId) -> bool {
        match self.entries.get_mut(node_id) {
            Some(entry) => {
                entry.stage = Stage::SuccessSent;
                true
            }
            None => false,
        }
    }

    pub fn note_responder_confirmed(&mut self, node_id: &NodeId) -> bool {
        match self.entries.get_mut(node_id) {
            Some(entry) => {
                entry.responder_confirmed = true;
                true
            }
            None => false,
        }
    }

    /// The transport association for the peer is now reserved.
    pub fn note_transport_reserved(&mut self, node_id: &NodeId) -> bool {
        match self.entries.get_mut(node_id) {
            Some(entry) => {
                if entry.stage < Stage::Pending {
                    entry.stage = Stage::Pending;
                }
                true
            }
            None => false,
        }
    }

    /// Drain every entry older than `ttl` and hand it back so the caller
    /// can tear down transport state outside the directory lock.
    pub fn expire(&mut self, ttl: Duration) -> Vec<PendingPeer> {
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.since) >= ttl)
            .map(|(id, _)| *id)
            .collect();

        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }
}
