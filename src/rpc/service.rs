//! Inbound request handlers.
//!
//! Each handler receives the mutable envelope and rewrites it into the
//! response; a cleared envelope tells the dispatcher to drop the exchange.
//! Admission decisions are computed under the directory lock, which is
//! released before any transport call.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::common::messages::{
    ConnectRequest, ConnectSuccess, Contact, Envelope, FindNodesRequest, PingRequest, WirePayload,
};
use crate::common::{NodeId, NodeInfo};
use crate::directory::{NodeDirectory, Role, Stage};
use crate::network::{AddConnection, Network};
use crate::rpc::{factory, PublicKeyRequester, RequestHandling};

/// The service half of the routing protocol: answers `Ping`, `Connect`,
/// `FindNodes` and `ConnectSuccess` from peers.
pub struct Service {
    directory: Arc<Mutex<NodeDirectory>>,
    network: Arc<dyn Network>,
    public_key_requester: Mutex<Option<PublicKeyRequester>>,
}

enum Admission {
    /// Do not answer at all.
    Drop,
    /// Answer with `answer = false`.
    Refuse,
    Accept,
}

impl Service {
    pub fn new(directory: Arc<Mutex<NodeDirectory>>, network: Arc<dyn Network>) -> Self {
        Self {
            directory,
            network,
            public_key_requester: Mutex::new(None),
        }
    }

    fn directory(&self) -> MutexGuard<'_, NodeDirectory> {
        self.directory.lock().expect("directory mutex poisoned")
    }

    /// Local identity snapshot so handlers can work off-lock.
    fn local_snapshot(&self) -> (NodeId, NodeId, bool, u8) {
        let dir = self.directory();
        (
            dir.local_id(),
            dir.connection_id(),
            dir.client_mode(),
            dir.config().hops_to_live,
        )
    }

    pub fn set_public_key_requester(&self, requester: PublicKeyRequester) {
        *self
            .public_key_requester
            .lock()
            .expect("requester mutex poisoned") = Some(requester);
    }

    pub fn public_key_requester(&self) -> Option<PublicKeyRequester> {
        self.public_key_requester
            .lock()
            .expect("requester mutex poisoned")
            .clone()
    }

    /// Answer a ping. Pure with respect to the directory.
    pub fn ping(&self, message: &mut Envelope) {
        let (local_id, _, _, hops) = self.local_snapshot();
        if message.destination_id != Some(local_id) {
            debug!("ping not for this node");
            message.clear();
            return;
        }

        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        if let Err(error) = PingRequest::decode(payload) {
            debug!(%error, "unable to parse ping request");
            message.clear();
            return;
        }

        let response = factory::ping_response(message, local_id, hops);
        *message = response;
    }

    /// Serve a connect request: decide admission, reserve a transport
    /// association, and answer with the local contact block on success.
    pub fn connect(&self, message: &mut Envelope) {
        let (local_id, local_connection_id, client_mode, hops) = self.local_snapshot();
        if message.destination_id != Some(local_id) {
            debug!("connect request not for this node");
            message.clear();
            return;
        }

        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        let Ok(request) = ConnectRequest::decode(payload) else {
            debug!("unable to parse connect request");
            message.clear();
            return;
        };

        let candidate = NodeInfo::from_contact(&request.contact, message.client_node);
        trace!(peer = %candidate.node_id, "received connect request");

        if candidate.endpoints.is_unspecified() {
            warn!(peer = %candidate.node_id, "connect request advertises no endpoints");
            message.clear();
            return;
        }

        let admission = {
            let mut dir = self.directory();

            // Simultaneous dial in both directions: the numerically smaller
            // id keeps the requester role, the other side cancels its own
            // attempt and serves the inbound request instead.
            let dialing = dir
                .pending(&candidate.node_id)
                .map(|entry| entry.role == Role::Requester)
                .unwrap_or(false);
            if dialing {
                if local_id < candidate.node_id {
                    debug!(peer = %candidate.node_id, "simultaneous connect, keeping requester role");
                    Admission::Drop
                } else {
                    debug!(peer = %candidate.node_id, "simultaneous connect, yielding requester role");
                    dir.drop_pending(&candidate.node_id);
                    self.admission_check(&dir, &candidate, message.client_node)
                }
            } else {
                self.admission_check(&dir, &candidate, message.client_node)
            }
        };

        match admission {
            Admission::Drop => {
                message.clear();
                return;
            }
            Admission::Refuse => {
                trace!(peer = %candidate.node_id, client = message.client_node, "connect refused");
                let response =
                    factory::connect_response(message, None, local_id, client_mode, hops);
                *message = response;
                return;
            }
            Admission::Accept => {}
        }

        let (our_endpoints, our_nat) = match self
            .network
            .get_available_endpoint(&candidate.connection_id, &candidate.endpoints)
        {
            Ok(pair) => pair,
            Err(error) => {
                // Suppress the reply; the requester times out on its own.
                warn!(peer = %candidate.node_id, %error, "no endpoint for connect request");
                message.clear();
                return;
            }
        };

        let added = self.network.add(AddConnection {
            local_id,
            local_connection_id,
            peer_id: candidate.node_id,
            peer_connection_id: candidate.connection_id,
            peer_endpoints: candidate.endpoints,
            requestor: false,
            client_mode,
        });

        let answer = match added {
            Ok(()) => Some(Contact {
                node_id: local_id,
                connection_id: local_connection_id,
                endpoints: our_endpoints,
                nat_type: our_nat,
            }),
            Err(error) => {
                warn!(peer = %candidate.node_id, %error, "transport refused connection");
                None
            }
        };

        if answer.is_some() {
            // Our half of the association is up; tell the requester so it
            // can acknowledge once its own gates pass.
            let success = factory::connect_success(
                0,
                candidate.node_id,
                local_id,
                local_connection_id,
                false,
                client_mode,
                hops,
            );
            self.network
                .send_to_direct(&success, &candidate.node_id, &candidate.connection_id);
        }

        let response = factory::connect_response(message, answer, local_id, client_mode, hops);
        *message = response;
    }

    fn admission_check(
        &self,
        dir: &NodeDirectory,
        candidate: &NodeInfo,
        client: bool,
    ) -> Admission {
        let admitted = if client {
            dir.check_client(candidate, &dir.furthest_close_id())
        } else {
            dir.check_node(candidate)
        };
        if admitted {
            Admission::Accept
        } else {
            Admission::Refuse
        }
    }

    /// Answer a discovery query with the local id followed by the closest
    /// known peers. Pure with respect to the directory.
    pub fn find_nodes(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        let Ok(request) = FindNodesRequest::decode(payload) else {
            warn!("unable to parse find nodes request");
            message.clear();
            return;
        };

        if request.num_nodes_requested == 0 || request.target_node.is_zero() {
            warn!("invalid find nodes request");
            message.clear();
            return;
        }

        let (nodes, local_id, client_mode, hops) = {
            let dir = self.directory();
            let mut nodes = vec![dir.local_id()];
            nodes.extend(dir.closest_nodes(
                &request.target_node,
                request.num_nodes_requested as usize - 1,
            ));
            (
                nodes,
                dir.local_id(),
                dir.client_mode(),
                dir.config().hops_to_live,
            )
        };

        trace!(count = nodes.len(), target = %request.target_node, "answering find nodes");
        let response = factory::find_nodes_response(message, nodes, local_id, client_mode, hops);
        *message = response;
    }

    /// A peer reports its half of the association is up. The reply, if
    /// any, goes out of band; the inbound envelope is always consumed.
    pub fn connect_success(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        let Ok(success) = ConnectSuccess::decode(payload) else {
            warn!("unable to parse connect success");
            message.clear();
            return;
        };

        if success.node_id.is_zero() || success.connection_id.is_zero() {
            warn!("connect success with unset ids");
            message.clear();
            return;
        }

        let mut peer = NodeInfo::new(success.node_id, success.connection_id);
        peer.is_client = message.client_node;

        if success.requestor {
            self.connect_success_from_requester(peer);
        } else {
            self.connect_success_from_responder(peer);
        }
        message.clear();
    }

    /// The original requester confirmed; park it in the ledger until the
    /// acknowledgement round admits it.
    fn connect_success_from_requester(&self, peer: NodeInfo) {
        let mut dir = self.directory();
        if dir.contains(&peer.node_id) {
            trace!(peer = %peer.node_id, "connect success for already admitted peer");
            return;
        }
        dir.add_pending(peer, Role::Responder, Stage::Pending);
    }

    /// The responder confirmed its half. Acknowledge with our close-group
    /// hints, but only once our own key gate has passed; an earlier
    /// confirmation is parked on the ledger entry instead.
    fn connect_success_from_responder(&self, peer: NodeInfo) {
        let (ready, close_ids, local_id, local_connection_id, client_mode, hops) = {
            let mut dir = self.directory();
            let ready = if dir.contains(&peer.node_id) {
                // Resend: the peer may have missed the first acknowledgement.
                Some(true)
            } else {
                match dir.pending(&peer.node_id).map(|entry| entry.stage) {
                    Some(stage) if stage >= Stage::Validated => Some(true),
                    Some(_) => {
                        dir.note_responder_confirmed(&peer.node_id);
                        Some(false)
                    }
                    None => None,
                }
            };
            (
                ready,
                dir.close_nodes(),
                dir.local_id(),
                dir.connection_id(),
                dir.client_mode(),
                dir.config().hops_to_live,
            )
        };

        match ready {
            None => {
                trace!(peer = %peer.node_id, "connect success from unknown responder");
                return;
            }
            Some(false) => {
                trace!(peer = %peer.node_id, "responder confirmed before key validation");
                return;
            }
            Some(true) => {}
        }

        let ack = factory::connect_success_acknowledgement(
            0,
            peer.node_id,
            local_id,
            local_connection_id,
            true,
            close_ids,
            client_mode,
            hops,
        );
        self.network
            .send_to_direct(&ack, &peer.node_id, &peer.connection_id);
    }
}

impl RequestHandling for Service {
    fn ping(&self, message: &mut Envelope) {
        Service::ping(self, message);
    }

    fn connect(&self, message: &mut Envelope) {
        Service::connect(self, message);
    }

    fn find_nodes(&self, message: &mut Envelope) {
        Service::find_nodes(self, message);
    }

    fn connect_success(&self, message: &mut Envelope) {
        Service::connect_success(self, message);
    }
}
