//! # overline
//!
//! The routing core of a structured peer-to-peer overlay: a Kademlia-style
//! XOR-metric network layered over a reliable, connection-oriented UDP
//! transport.
//!
//! The crate maintains each node's view of the network (its routing table
//! and client table), answers discovery and connection RPCs from peers,
//! and drives progressive densification of the node's neighborhood after
//! bootstrap. The transport itself stays behind the [`Network`] trait;
//! peers become routable only after the four-message connect handshake and
//! an asynchronous public-key validation both succeed.

pub mod common;
mod config;
pub mod directory;
mod error;
pub mod network;
pub mod rpc;

pub use crate::common::{messages, EndpointPair, NatType, NodeId, NodeInfo, ID_SIZE};
pub use crate::config::Config;
pub use crate::directory::NodeDirectory;
pub use crate::error::Error;
pub use crate::network::{AddConnection, Network, NetworkError};
pub use crate::rpc::{
    Overlay, PublicKeyRequester, RequestHandling, ResponseHandler, ResponseHandling, Service,
    Timer,
};

/// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
