//! Main crate error.

use crate::network::NetworkError;

#[derive(thiserror::Error, Debug)]
/// Errors surfaced by the routing core.
///
/// None of these are fatal; each one is local to a single peer interaction.
pub enum Error {
    /// Malformed envelope or payload bytes.
    #[error("failed to parse message: {0}")]
    Parse(#[from] serde_bencode::Error),

    /// A byte string of the wrong length was offered as a node id.
    #[error("invalid node id length: {0}")]
    InvalidIdLength(usize),

    /// The envelope was addressed to some other node.
    #[error("message destination does not match the local node")]
    DestinationMismatch,

    #[error(transparent)]
    /// Transparent transport error.
    Transport(#[from] NetworkError),

    /// The public-key validator declined or found no key for the peer.
    #[error("public key validation failed")]
    ValidationFailure,

    /// An outstanding request expired before its response arrived.
    #[error("request timed out")]
    Timeout,

    /// The entry is already present; adds are idempotent no-ops.
    #[error("entry already present")]
    DuplicateEntry,

    /// The table is full and the candidate does not displace anyone.
    #[error("table capacity reached")]
    CapacityReached,

    /// No entry under the given id.
    #[error("no such entry")]
    NotFound,
}
