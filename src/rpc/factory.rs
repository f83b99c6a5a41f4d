//! Pure constructors for RPC envelopes.
//!
//! Each function returns a fully formed [`Envelope`] with the right flag
//! defaults for its message: requests carry a fresh correlation id and a
//! signature over their payload, responses echo the request's id, payload
//! and signature. Nothing here touches any state; handing an unset node id
//! to any constructor is a programming error.

use ed25519_dalek::{Signer, SigningKey};
use serde_bytes::ByteBuf;

use crate::common::messages::{
    unix_timestamp, CloseNodeUpdate, ConnectRequest, ConnectResponse, ConnectSuccess,
    ConnectSuccessAck, Contact, Envelope, FindNodesRequest, FindNodesResponse, GetGroupRequest,
    GetGroupResponse, Kind, PingRequest, PingResponse, WirePayload,
};
use crate::common::NodeId;

fn sign(keys: &SigningKey, payload: &[u8]) -> Vec<u8> {
    keys.sign(payload).to_bytes().to_vec()
}

fn request(message_id: u32, kind: Kind, source: NodeId, destination: NodeId, hops: u8) -> Envelope {
    debug_assert!(!source.is_zero(), "unset source id");
    debug_assert!(!destination.is_zero(), "unset destination id");
    Envelope {
        id: message_id,
        kind,
        source_id: Some(source),
        destination_id: Some(destination),
        data: Vec::new(),
        signature: Vec::new(),
        request: true,
        direct: true,
        client_node: false,
        replication: 1,
        hops_to_live: hops,
        route_history: Vec::new(),
    }
}

/// A response envelope keeps the request's correlation id and goes back to
/// its source; a relayed request (no source id) leaves the destination for
/// the relay layer to resolve.
fn response(original: &Envelope, source: NodeId, client_node: bool, hops: u8) -> Envelope {
    debug_assert!(!source.is_zero(), "unset source id");
    Envelope {
        id: original.id,
        kind: original.kind,
        source_id: Some(source),
        destination_id: original.source_id,
        data: Vec::new(),
        signature: Vec::new(),
        request: false,
        direct: true,
        client_node,
        replication: 1,
        hops_to_live: hops,
        route_history: Vec::new(),
    }
}

fn echo(original: &Envelope) -> (ByteBuf, ByteBuf) {
    (
        ByteBuf::from(original.payload().unwrap_or_default().to_vec()),
        ByteBuf::from(original.signature.clone()),
    )
}

pub fn ping_request(
    message_id: u32,
    destination: NodeId,
    local_id: NodeId,
    keys: &SigningKey,
    hops: u8,
) -> Envelope {
    let payload = PingRequest {
        ping: true,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = request(message_id, Kind::Ping, local_id, destination, hops);
    message.signature = sign(keys, &payload);
    message.data = vec![payload];
    message
}

pub fn ping_response(original: &Envelope, local_id: NodeId, hops: u8) -> Envelope {
    let (original_request, original_signature) = echo(original);
    let payload = PingResponse {
        pong: true,
        original_request,
        original_signature,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = response(original, local_id, false, hops);
    message.data = vec![payload];
    message
}

pub fn connect_request(
    message_id: u32,
    destination: NodeId,
    own_contact: Contact,
    client_node: bool,
    keys: &SigningKey,
    hops: u8,
) -> Envelope {
    let payload = ConnectRequest {
        contact: own_contact,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = request(message_id, Kind::Connect, own_contact.node_id, destination, hops);
    message.client_node = client_node;
    message.signature = sign(keys, &payload);
    message.data = vec![payload];
    message
}

/// `answer_contact` present means the connect was accepted and carries the
/// responder's own contact block.
pub fn connect_response(
    original: &Envelope,
    answer_contact: Option<Contact>,
    local_id: NodeId,
    client_node: bool,
    hops: u8,
) -> Envelope {
    let (original_request, original_signature) = echo(original);
    let payload = ConnectResponse {
        answer: answer_contact.is_some(),
        contact: answer_contact,
        original_request,
        original_signature,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = response(original, local_id, client_node, hops);
    message.data = vec![payload];
    message
}

pub fn find_nodes_request(
    message_id: u32,
    destination: NodeId,
    target: NodeId,
    num_nodes_requested: u32,
    local_id: NodeId,
    keys: &SigningKey,
    hops: u8,
) -> Envelope {
    debug_assert!(!target.is_zero(), "unset target id");
    let payload = FindNodesRequest {
        num_nodes_requested,
        target_node: target,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = request(message_id, Kind::FindNodes, local_id, destination, hops);
    message.signature = sign(keys, &payload);
    message.data = vec![payload];
    message
}

pub fn find_nodes_response(
    original: &Envelope,
    nodes: Vec<NodeId>,
    local_id: NodeId,
    client_node: bool,
    hops: u8,
) -> Envelope {
    let (original_request, original_signature) = echo(original);
    let payload = FindNodesResponse {
        nodes,
        original_request,
        original_signature,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = response(original, local_id, client_node, hops);
    message.data = vec![payload];
    message
}

/// Sent over the fresh association once the local transport add completed.
pub fn connect_success(
    message_id: u32,
    destination: NodeId,
    local_id: NodeId,
    local_connection_id: NodeId,
    requestor: bool,
    client_node: bool,
    hops: u8,
) -> Envelope {
    let payload = ConnectSuccess {
        node_id: local_id,
        connection_id: local_connection_id,
        requestor,
    }
    .encode();

    let mut message = request(message_id, Kind::ConnectSuccess, local_id, destination, hops);
    message.client_node = client_node;
    message.data = vec![payload];
    message
}

pub fn connect_success_acknowledgement(
    message_id: u32,
    destination: NodeId,
    local_id: NodeId,
    local_connection_id: NodeId,
    requestor: bool,
    close_ids: Vec<NodeId>,
    client_node: bool,
    hops: u8,
) -> Envelope {
    let payload = ConnectSuccessAck {
        node_id: local_id,
        connection_id: local_connection_id,
        requestor,
        close_ids,
        client_node,
    }
    .encode();

    let mut message = request(message_id, Kind::ConnectSuccessAck, local_id, destination, hops);
    message.request = false;
    message.client_node = client_node;
    message.data = vec![payload];
    message
}

pub fn get_group_request(
    message_id: u32,
    target: NodeId,
    local_id: NodeId,
    keys: &SigningKey,
    hops: u8,
) -> Envelope {
    let payload = GetGroupRequest {
        target,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = request(message_id, Kind::GetGroup, local_id, target, hops);
    message.signature = sign(keys, &payload);
    message.data = vec![payload];
    message
}

pub fn get_group_response(
    original: &Envelope,
    group: Vec<NodeId>,
    local_id: NodeId,
    hops: u8,
) -> Envelope {
    let (original_request, original_signature) = echo(original);
    let payload = GetGroupResponse {
        group,
        original_request,
        original_signature,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = response(original, local_id, false, hops);
    message.data = vec![payload];
    message
}

pub fn close_node_update(
    message_id: u32,
    destination: NodeId,
    local_id: NodeId,
    close_ids: Vec<NodeId>,
    hops: u8,
) -> Envelope {
    let payload = CloseNodeUpdate {
        node_id: local_id,
        close_ids,
        timestamp: unix_timestamp(),
    }
    .encode();

    let mut message = request(message_id, Kind::CloseNodeUpdate, local_id, destination, hops);
    message.request = false;
    message.data = vec![payload];
    message
}
