//! Overlay node id and the XOR closeness metric.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::BitXor;

use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};

use crate::{Error, Result};

/// The size of node ids in bytes (512 bits).
pub const ID_SIZE: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Fixed-width overlay identifier.
///
/// Closeness between ids is the XOR metric: `a` is closer to `t` than `b`
/// iff `a ^ t < b ^ t` interpreted as an unsigned big-endian integer.
///
/// The all-zero id is syntactically valid on the wire but never a legal
/// peer identity; handlers treat it as "unset".
pub struct NodeId(pub [u8; ID_SIZE]);

impl NodeId {
    /// The unset id.
    pub const ZERO: NodeId = NodeId([0; ID_SIZE]);
    /// The id farthest from every other id's neighborhood boundary checks.
    pub const MAX: NodeId = NodeId([0xff; ID_SIZE]);

    /// Generate a uniformly random id.
    pub fn random() -> NodeId {
        let mut bytes = [0u8; ID_SIZE];
        rand::thread_rng().fill(&mut bytes[..]);
        NodeId(bytes)
    }

    /// Create an id from raw bytes. Errors unless `bytes` is exactly
    /// [`ID_SIZE`] long.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<NodeId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdLength(bytes.len()));
        }

        let mut tmp = [0u8; ID_SIZE];
        tmp.copy_from_slice(bytes);
        Ok(NodeId(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// True for the all-zero (unset) id.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// XOR distance to `other`, kept as an id-width big-endian integer.
    pub fn xor(&self, other: &NodeId) -> NodeId {
        *self ^ *other
    }

    /// `true` iff `lhs` is strictly closer to `target` than `rhs`.
    pub fn closer_to_target(lhs: &NodeId, rhs: &NodeId, target: &NodeId) -> bool {
        lhs.xor(target) < rhs.xor(target)
    }

    /// Total order on ids by distance from `target`. Distances are equal
    /// only for equal ids, so the raw id order only breaks exact ties.
    pub fn cmp_distance(&self, other: &NodeId, target: &NodeId) -> Ordering {
        self.xor(target)
            .cmp(&other.xor(target))
            .then_with(|| self.cmp(other))
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(mut self, rhs: NodeId) -> NodeId {
        for (dst, src) in self.0.iter_mut().zip(rhs.0.iter()) {
            *dst ^= *src;
        }
        self
    }
}

impl From<[u8; ID_SIZE]> for NodeId {
    fn from(bytes: [u8; ID_SIZE]) -> NodeId {
        NodeId(bytes)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<NodeId, D::Error> {
        let buf = ByteBuf::deserialize(deserializer)?;
        NodeId::from_bytes(buf.as_slice())
            .map_err(|_| D::Error::invalid_length(buf.len(), &"a 64 byte node id"))
    }
}
