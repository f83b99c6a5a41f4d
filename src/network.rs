//! Contract of the reliable connection-oriented UDP transport.
//!
//! The routing core never owns a socket; it drives the transport through
//! this trait and stays oblivious to hole punching, retransmission and
//! framing. Implementations must be safe to call from any handler thread.

use crate::common::messages::Envelope;
use crate::common::{EndpointPair, NatType, NodeId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Transport failures as seen by the routing core.
pub enum NetworkError {
    /// No local endpoint pair could be matched to the peer's.
    #[error("no local endpoint available")]
    EndpointUnavailable,

    /// The transport refused to create the association.
    #[error("connection add failed: {0}")]
    AddFailed(String),

    /// The peer cannot be reached over any known association.
    #[error("peer unreachable")]
    Unreachable,
}

#[derive(Debug, Clone)]
/// Parameters for reserving a transport association with a peer.
pub struct AddConnection {
    pub local_id: NodeId,
    pub local_connection_id: NodeId,
    pub peer_id: NodeId,
    pub peer_connection_id: NodeId,
    pub peer_endpoints: EndpointPair,
    /// True when this node initiated the `ConnectRequest`.
    pub requestor: bool,
    pub client_mode: bool,
}

/// The transport operations the routing core depends on.
pub trait Network: Send + Sync {
    /// Reserve a local endpoint pair able to reach the peer's advertised
    /// pair, reporting the local NAT class alongside.
    fn get_available_endpoint(
        &self,
        peer_connection_id: &NodeId,
        peer_endpoints: &EndpointPair,
    ) -> Result<(EndpointPair, NatType), NetworkError>;

    /// Create (or begin hole-punching toward) the association described by
    /// `conn`.
    fn add(&self, conn: AddConnection) -> Result<(), NetworkError>;

    /// Tear down any association with the peer. Removing an unknown peer is
    /// a no-op.
    fn remove(&self, peer_connection_id: &NodeId);

    /// Send over an established association.
    fn send_to_direct(&self, message: &Envelope, peer_id: &NodeId, peer_connection_id: &NodeId);

    /// Source-route via the routing table toward the envelope destination.
    fn send_to_closest(&self, message: &Envelope);
}
