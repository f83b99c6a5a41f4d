//! Peer records: endpoints, NAT class and the table entry itself.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::common::messages::Contact;
use crate::common::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
/// Categorical description of a peer's NAT behavior, used by the transport
/// to pick a hole-punching strategy.
pub enum NatType {
    Unknown,
    Cone,
    Symmetric,
}

impl From<NatType> for u8 {
    fn from(nat: NatType) -> u8 {
        match nat {
            NatType::Unknown => 0,
            NatType::Cone => 1,
            NatType::Symmetric => 2,
        }
    }
}

impl From<u8> for NatType {
    fn from(byte: u8) -> NatType {
        match byte {
            1 => NatType::Cone,
            2 => NatType::Symmetric,
            _ => NatType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// A peer's advertised public (NAT-external) and private (LAN) endpoints.
///
/// Either side may be absent; a pair with both sides absent is
/// "unspecified" and never a valid connect target.
pub struct EndpointPair {
    #[serde(with = "compact_endpoint")]
    pub public: Option<SocketAddrV4>,
    #[serde(with = "compact_endpoint")]
    pub private: Option<SocketAddrV4>,
}

impl EndpointPair {
    pub fn new(public: Option<SocketAddrV4>, private: Option<SocketAddrV4>) -> Self {
        Self { public, private }
    }

    /// Neither endpoint is advertised.
    pub fn is_unspecified(&self) -> bool {
        self.public.is_none() && self.private.is_none()
    }
}

/// Compact wire form for an optional v4 endpoint: an empty byte string for
/// "absent", or 4 ip bytes followed by a big-endian port.
mod compact_endpoint {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_bytes::{ByteBuf, Bytes};

    pub(super) fn serialize<S: Serializer>(
        addr: &Option<SocketAddrV4>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match addr {
            None => Bytes::new(&[]).serialize(s),
            Some(addr) => {
                let mut bytes = [0u8; 6];
                bytes[..4].copy_from_slice(&addr.ip().octets());
                bytes[4..].copy_from_slice(&addr.port().to_be_bytes());
                Bytes::new(&bytes).serialize(s)
            }
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<SocketAddrV4>, D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        match buf.len() {
            0 => Ok(None),
            6 => {
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Some(SocketAddrV4::new(ip, port)))
            }
            n => Err(D::Error::invalid_length(n, &"an empty or 6 byte endpoint")),
        }
    }
}

#[derive(Clone, PartialEq)]
/// Everything the directory knows about one peer.
///
/// `connection_id` is the transport-layer handle, distinct from `node_id`
/// so that several logical identities can share one physical connection
/// during bootstrap. `public_key` is populated only once asynchronous
/// validation has completed.
pub struct NodeInfo {
    pub node_id: NodeId,
    pub connection_id: NodeId,
    pub endpoints: EndpointPair,
    pub public_key: Option<VerifyingKey>,
    pub is_client: bool,
    pub nat_type: NatType,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, connection_id: NodeId) -> Self {
        Self {
            node_id,
            connection_id,
            endpoints: EndpointPair::default(),
            public_key: None,
            is_client: false,
            nat_type: NatType::Unknown,
        }
    }

    /// Build a candidate record from a wire contact block.
    pub fn from_contact(contact: &Contact, is_client: bool) -> Self {
        Self {
            node_id: contact.node_id,
            connection_id: contact.connection_id,
            endpoints: contact.endpoints,
            public_key: None,
            is_client,
            nat_type: contact.nat_type,
        }
    }

    /// The wire contact block for this peer. The key never travels with it.
    pub fn contact(&self) -> Contact {
        Contact {
            node_id: self.node_id,
            connection_id: self.connection_id,
            endpoints: self.endpoints,
            nat_type: self.nat_type,
        }
    }
}

impl Debug for NodeInfo {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("NodeInfo")
            .field("node_id", &self.node_id)
            .field("connection_id", &self.connection_id)
            .field("is_client", &self.is_client)
            .field("validated", &self.public_key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn endpoint_pair_round_trip() {
        let pair = EndpointPair::new(
            Some(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 5483)),
            None,
        );

        let bytes = serde_bencode::to_bytes(&pair).unwrap();
        let back: EndpointPair = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(pair, back);
    }

    #[test]
    fn unspecified_pair() {
        assert!(EndpointPair::default().is_unspecified());
        assert!(!EndpointPair::new(
            None,
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 9), 5483))
        )
        .is_unspecified());
    }

    #[test]
    fn nat_type_survives_unknown_bytes() {
        assert_eq!(NatType::from(1u8), NatType::Cone);
        assert_eq!(NatType::from(77u8), NatType::Unknown);
    }

    #[test]
    fn contact_round_trip() {
        let info = NodeInfo {
            endpoints: EndpointPair::new(
                Some(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 2), 6001)),
                Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6001)),
            ),
            nat_type: NatType::Cone,
            ..NodeInfo::new(NodeId::random(), NodeId::random())
        };

        let back = NodeInfo::from_contact(&info.contact(), false);
        assert_eq!(back.node_id, info.node_id);
        assert_eq!(back.connection_id, info.connection_id);
        assert_eq!(back.endpoints, info.endpoints);
        assert_eq!(back.nat_type, info.nat_type);
        assert_eq!(back.public_key, None);
    }
}
