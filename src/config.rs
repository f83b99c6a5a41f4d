use std::time::Duration;

/// Default close-group cardinality.
pub const DEFAULT_CLOSEST_NODES_SIZE: usize = 8;
/// Default routing table capacity.
pub const DEFAULT_MAX_ROUTING_TABLE_SIZE: usize = 64;
/// Default deadline for an outstanding request before its waiter is told to
/// give up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
/// Routing core configuration.
pub struct Config {
    /// Cardinality of the close group: the prefix of the routing table used
    /// for replication and group decisions.
    pub closest_nodes_size: usize,
    /// Upper bound on the number of server peers in the routing table.
    pub max_routing_table_size: usize,
    /// Upper bound on the number of client connections this node serves.
    pub max_client_table_size: usize,
    /// Initial TTL stamped on outgoing envelopes.
    pub hops_to_live: u8,
    /// How many times a failed transport `add` is retried before the peer
    /// is discarded.
    pub connect_attempt_limit: usize,
    /// How long a peer may sit in the handshake ledger without confirming.
    /// Absence of confirmation within this window is equivalent to a
    /// rejection.
    pub pending_ttl: Duration,
    /// Deadline for outstanding requests tracked by [`Timer`](crate::rpc::Timer).
    pub request_timeout: Duration,
    /// How long a peer that failed connection or key validation is skipped
    /// by the densification loop before it may be dialed again.
    pub failed_peer_backoff: Duration,
    /// Capacity of the recently-failed peer memo.
    pub failed_peer_memory: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            closest_nodes_size: DEFAULT_CLOSEST_NODES_SIZE,
            max_routing_table_size: DEFAULT_MAX_ROUTING_TABLE_SIZE,
            max_client_table_size: 64,
            hops_to_live: 20,
            connect_attempt_limit: 3,
            pending_ttl: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failed_peer_backoff: Duration::from_secs(60),
            failed_peer_memory: 128,
        }
    }
}
