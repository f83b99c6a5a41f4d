//! Wire envelopes and RPC payloads.
//!
//! The [`Envelope`] is the mutable unit of I/O: request handlers rewrite an
//! inbound envelope into its response in place, and an emptied envelope
//! ([`Envelope::clear`]) is the convention for "do not reply". Payloads
//! travel bencoded inside `data[0]`; every response payload echoes the
//! serialized request and its signature so the requester can correlate and
//! check freshness.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::node::{EndpointPair, NatType};
use crate::common::NodeId;
use crate::Result;

/// Seconds since the unix epoch, the freshness stamp carried by payloads.
pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Bencode has no boolean; flags travel as integers.
mod bool_int {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(flag: &bool, s: S) -> Result<S::Ok, S::Error> {
        i64::from(*flag).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(i64::deserialize(d)? != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
/// Which RPC an envelope carries, so the dispatcher can demultiplex without
/// touching the payload.
pub enum Kind {
    Ping,
    Connect,
    FindNodes,
    ConnectSuccess,
    ConnectSuccessAck,
    GetGroup,
    CloseNodeUpdate,
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> u8 {
        match kind {
            Kind::Ping => 0,
            Kind::Connect => 1,
            Kind::FindNodes => 2,
            Kind::ConnectSuccess => 3,
            Kind::ConnectSuccessAck => 4,
            Kind::GetGroup => 5,
            Kind::CloseNodeUpdate => 6,
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = String;

    fn try_from(byte: u8) -> Result<Kind, Self::Error> {
        match byte {
            0 => Ok(Kind::Ping),
            1 => Ok(Kind::Connect),
            2 => Ok(Kind::FindNodes),
            3 => Ok(Kind::ConnectSuccess),
            4 => Ok(Kind::ConnectSuccessAck),
            5 => Ok(Kind::GetGroup),
            6 => Ok(Kind::CloseNodeUpdate),
            other => Err(format!("unknown message kind {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The routed message envelope.
///
/// A *relay* envelope omits `source_id`: it is carried indirectly on behalf
/// of a node that is not yet part of the routing graph, and responses to it
/// leave `destination_id` unset for the relay layer to resolve.
pub struct Envelope {
    /// Correlation id matching responses to outstanding requests.
    pub id: u32,
    pub kind: Kind,
    #[serde(default)]
    pub source_id: Option<NodeId>,
    #[serde(default)]
    pub destination_id: Option<NodeId>,
    #[serde(default)]
    pub data: Vec<ByteBuf>,
    #[serde(with = "serde_bytes", default)]
    pub signature: Vec<u8>,
    #[serde(with = "bool_int")]
    pub request: bool,
    #[serde(with = "bool_int")]
    pub direct: bool,
    #[serde(with = "bool_int")]
    pub client_node: bool,
    pub replication: u8,
    pub hops_to_live: u8,
    #[serde(default)]
    pub route_history: Vec<NodeId>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: 0,
            kind: Kind::Ping,
            source_id: None,
            destination_id: None,
            data: Vec::new(),
            signature: Vec::new(),
            request: false,
            direct: false,
            client_node: false,
            replication: 0,
            hops_to_live: 0,
            route_history: Vec::new(),
        }
    }
}

impl Envelope {
    /// Decode an envelope from its wire frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }

    /// Encode the envelope into a wire frame.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_bencode::to_bytes(self)?))
    }

    /// The primary payload, when one is present.
    pub fn payload(&self) -> Option<&[u8]> {
        self.data.first().map(|buf| buf.as_slice())
    }

    /// Empty the envelope. A cleared envelope is never sent.
    pub fn clear(&mut self) {
        *self = Envelope::default();
    }

    pub fn is_cleared(&self) -> bool {
        self.data.is_empty()
    }
}

/// A payload that travels bencoded inside `Envelope::data`.
pub trait WirePayload: Serialize + DeserializeOwned {
    /// Encode into payload bytes. Serialization of these plain structs
    /// cannot fail short of a bug.
    fn encode(&self) -> ByteBuf {
        ByteBuf::from(serde_bencode::to_bytes(self).expect("payload serialization"))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// The contact block a peer advertises about itself.
pub struct Contact {
    pub node_id: NodeId,
    pub connection_id: NodeId,
    pub endpoints: EndpointPair,
    pub nat_type: NatType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(with = "bool_int")]
    pub ping: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(with = "bool_int")]
    pub pong: bool,
    pub original_request: ByteBuf,
    pub original_signature: ByteBuf,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub contact: Contact,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(with = "bool_int")]
    pub answer: bool,
    /// The responder's contact block, present only when `answer` is true.
    #[serde(default)]
    pub contact: Option<Contact>,
    pub original_request: ByteBuf,
    pub original_signature: ByteBuf,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNodesRequest {
    pub num_nodes_requested: u32,
    pub target_node: NodeId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNodesResponse {
    pub nodes: Vec<NodeId>,
    pub original_request: ByteBuf,
    pub original_signature: ByteBuf,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Sent over the freshly established association by either side once its
/// transport add completed. `requestor` is true when the sender initiated
/// the original `ConnectRequest`.
pub struct ConnectSuccess {
    pub node_id: NodeId,
    pub connection_id: NodeId,
    #[serde(with = "bool_int")]
    pub requestor: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Final confirmation of the connection handshake. `requestor` describes
/// the *sender's* role in the original exchange; `close_ids` is the
/// sender's close-group hint used for transitive densification.
pub struct ConnectSuccessAck {
    pub node_id: NodeId,
    pub connection_id: NodeId,
    #[serde(with = "bool_int")]
    pub requestor: bool,
    #[serde(default)]
    pub close_ids: Vec<NodeId>,
    #[serde(with = "bool_int")]
    pub client_node: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetGroupRequest {
    pub target: NodeId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetGroupResponse {
    pub group: Vec<NodeId>,
    pub original_request: ByteBuf,
    pub original_signature: ByteBuf,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Notification from a close peer that a client's close-group membership
/// has shifted.
pub struct CloseNodeUpdate {
    pub node_id: NodeId,
    #[serde(default)]
    pub close_ids: Vec<NodeId>,
    pub timestamp: u64,
}

impl WirePayload for PingRequest {}
impl WirePayload for PingResponse {}
impl WirePayload for ConnectRequest {}
impl WirePayload for ConnectResponse {}
impl WirePayload for FindNodesRequest {}
impl WirePayload for FindNodesResponse {}
impl WirePayload for ConnectSuccess {}
impl WirePayload for ConnectSuccessAck {}
impl WirePayload for GetGroupRequest {}
impl WirePayload for GetGroupResponse {}
impl WirePayload for CloseNodeUpdate {}
