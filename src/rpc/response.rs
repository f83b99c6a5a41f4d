//! Inbound response handlers.
//!
//! This half ratchets the node from "just bootstrapped" toward "fully
//! connected": every `FindNodes` answer feeds the densification loop, and
//! every `Connect` answer walks the candidate through the transport, key
//! and handshake gates before the directory admits it.
//!
//! Key validation is asynchronous. The continuation handed to the
//! validator captures an owning handle to this component, never a raw
//! back-pointer, and re-acquires the directory lock when it fires.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use ed25519_dalek::VerifyingKey;
use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::common::messages::{
    CloseNodeUpdate, ConnectResponse, ConnectSuccessAck, Contact, Envelope, FindNodesResponse,
    GetGroupResponse, PingResponse, WirePayload,
};
use crate::common::{EndpointPair, NodeId, NodeInfo};
use crate::config::Config;
use crate::directory::{NodeDirectory, Role, Stage};
use crate::network::{AddConnection, Network};
use crate::rpc::{factory, PublicKeyRequester, ResponseHandling, Timer};

/// The response half of the routing protocol.
pub struct ResponseHandler {
    directory: Arc<Mutex<NodeDirectory>>,
    network: Arc<dyn Network>,
    timer: Arc<Timer>,
    config: Config,
    /// Keeps the handler addressable from validator continuations.
    self_handle: Weak<ResponseHandler>,
    public_key_requester: Mutex<Option<PublicKeyRequester>>,
    /// Peers that recently failed a gate; the densification loop skips
    /// them until the backoff lapses.
    recently_failed: Mutex<LruCache<NodeId, Instant>>,
}

enum AckOutcome {
    Ignore,
    Promoted,
    Deferred,
    Teardown(NodeId),
}

impl ResponseHandler {
    pub fn new(
        directory: Arc<Mutex<NodeDirectory>>,
        network: Arc<dyn Network>,
        timer: Arc<Timer>,
    ) -> Arc<Self> {
        let config = directory
            .lock()
            .expect("directory mutex poisoned")
            .config()
            .clone();
        let memo_capacity =
            NonZeroUsize::new(config.failed_peer_memory.max(1)).expect("non-zero capacity");

        Arc::new_cyclic(|weak| Self {
            directory,
            network,
            timer,
            config,
            self_handle: weak.clone(),
            public_key_requester: Mutex::new(None),
            recently_failed: Mutex::new(LruCache::new(memo_capacity)),
        })
    }

    fn directory(&self) -> MutexGuard<'_, NodeDirectory> {
        self.directory.lock().expect("directory mutex poisoned")
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

    // === Handlers ===

    /// Pong received. Best effort: resolve the waiter, change no state.
    pub fn ping(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            return;
        };
        match PingResponse::decode(payload) {
            Ok(response) => {
                trace!(pong = response.pong, "ping response");
                self.timer.resolve(message);
            }
            Err(error) => debug!(%error, "unable to parse ping response"),
        }
    }

    /// A peer answered our connect request. Walk the three gates.
    pub fn connect(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            return;
        };
        let Ok(response) = ConnectResponse::decode(payload) else {
            debug!("unable to parse connect response");
            return;
        };

        if !response.answer {
            if let Some(peer_id) = message.source_id {
                trace!(peer = %peer_id, "connect refused by peer");
                self.directory().drop_pending(&peer_id);
                self.mark_failed(peer_id);
            }
            return;
        }
        let Some(contact) = response.contact else {
            debug!("connect response accepted but carries no contact");
            return;
        };

        let peer = NodeInfo::from_contact(&contact, message.client_node);

        // The response is only actionable while our dial is outstanding.
        let proceed = {
            let mut dir = self.directory();
            if dir.contains(&peer.node_id) {
                trace!(peer = %peer.node_id, "slot already filled by another path");
                dir.drop_pending(&peer.node_id);
                false
            } else {
                let state = dir
                    .pending(&peer.node_id)
                    .map(|entry| (entry.role, entry.stage));
                match state {
                    Some((Role::Requester, Stage::Dialed)) => {
                        // Flesh out the dial entry with the full contact.
                        dir.update_pending_info(peer.clone());
                        true
                    }
                    Some(_) => {
                        trace!(peer = %peer.node_id, "out of order connect response");
                        false
                    }
                    None => {
                        trace!(peer = %peer.node_id, "connect response without outstanding dial");
                        false
                    }
                }
            }
        };
        if !proceed {
            return;
        }

        let (local_id, local_connection_id, client_mode) = {
            let dir = self.directory();
            (dir.local_id(), dir.connection_id(), dir.client_mode())
        };

        // Transport gate, with a small bounded retry.
        let conn = AddConnection {
            local_id,
            local_connection_id,
            peer_id: peer.node_id,
            peer_connection_id: peer.connection_id,
            peer_endpoints: peer.endpoints,
            requestor: true,
            client_mode,
        };
        let mut added = self.network.add(conn.clone());
        let mut attempt = 1;
        while added.is_err() && attempt < self.config.connect_attempt_limit {
            warn!(peer = %peer.node_id, attempt, "transport add failed, retrying");
            added = self.network.add(conn.clone());
            attempt += 1;
        }
        if let Err(error) = added {
            warn!(peer = %peer.node_id, %error, "giving up on peer after transport failures");
            self.directory().drop_pending(&peer.node_id);
            self.mark_failed(peer.node_id);
            return;
        }
        self.directory().note_transport_reserved(&peer.node_id);

        // Key gate, asynchronous. The continuation owns a handle to us.
        let Some(validator) = self.public_key_requester() else {
            warn!(peer = %peer.node_id, "no public key requester configured");
            self.directory().drop_pending(&peer.node_id);
            self.network.remove(&peer.connection_id);
            return;
        };
        let Some(handle) = self.self_handle.upgrade() else {
            return;
        };
        let peer_id = peer.node_id;
        validator(
            peer_id,
            Box::new(move |key| handle.complete_requester_validation(peer, key)),
        );
    }

    /// Continuation of [`Self::connect`] once the validator reports.
    fn complete_requester_validation(&self, peer: NodeInfo, key: Option<VerifyingKey>) {
        let Some(key) = key else {
            warn!(peer = %peer.node_id, "public key validation failed");
            self.directory().drop_pending(&peer.node_id);
            self.network.remove(&peer.connection_id);
            self.mark_failed(peer.node_id);
            return;
        };

        let (validated, promote_now, hinted, responder_confirmed) = {
            let mut dir = self.directory();
            if !dir.note_key_validated(&peer.node_id, key) {
                (false, false, Vec::new(), false)
            } else {
                let entry = dir.pending(&peer.node_id);
                let promote_now = entry.map(|e| e.peer_acknowledged).unwrap_or(false);
                let hinted = entry
                    .map(|e| e.hinted_close_ids.clone())
                    .unwrap_or_default();
                let responder_confirmed =
                    entry.map(|e| e.responder_confirmed).unwrap_or(false);
                (true, promote_now, hinted, responder_confirmed)
            }
        };
        if !validated {
            // The entry aged out while the validator was thinking.
            self.network.remove(&peer.connection_id);
            return;
        }

        // Handshake gate: announce success over the fresh association.
        let (local_id, local_connection_id, client_mode) = {
            let dir = self.directory();
            (dir.local_id(), dir.connection_id(), dir.client_mode())
        };
        let success = factory::connect_success(
            0,
            peer.node_id,
            local_id,
            local_connection_id,
            true,
            client_mode,
            self.config.hops_to_live,
        );
        self.network
            .send_to_direct(&success, &peer.node_id, &peer.connection_id);
        self.directory().note_success_sent(&peer.node_id);

        if responder_confirmed {
            // The responder reported in before the key gate; its
            // acknowledgement is due now.
            self.send_requester_acknowledgement(&peer);
        }
        if promote_now {
            // The peer's acknowledgement beat our validator; finish now.
            self.promote_as_requester(&peer.node_id, hinted);
        }
    }

    /// Our acknowledgement of the responder's `ConnectSuccess`, deferred
    /// until the key gate passed.
    fn send_requester_acknowledgement(&self, peer: &NodeInfo) {
        let (close_ids, local_id, local_connection_id, client_mode) = {
            let dir = self.directory();
            (
                dir.close_nodes(),
                dir.local_id(),
                dir.connection_id(),
                dir.client_mode(),
            )
        };
        let ack = factory::connect_success_acknowledgement(
            0,
            peer.node_id,
            local_id,
            local_connection_id,
            true,
            close_ids,
            client_mode,
            self.config.hops_to_live,
        );
        self.network
            .send_to_direct(&ack, &peer.node_id, &peer.connection_id);
    }

    /// Discovery results: dial everything new, in XOR order of usefulness.
    pub fn find_nodes(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            return;
        };
        let Ok(response) = FindNodesResponse::decode(payload) else {
            warn!("unable to parse find nodes response");
            return;
        };

        self.timer.resolve(message);

        trace!(count = response.nodes.len(), "find nodes response");
        for node_id in &response.nodes {
            self.check_and_send_connect_request(node_id);
        }
    }

    /// Final round of the four-message handshake, from either side.
    pub fn connect_success_acknowledgement(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        let Ok(ack) = ConnectSuccessAck::decode(payload) else {
            warn!("unable to parse connect success acknowledgement");
            message.clear();
            return;
        };

        if ack.node_id.is_zero() || ack.connection_id.is_zero() {
            warn!("acknowledgement with unset ids");
            message.clear();
            return;
        }

        let mut peer = NodeInfo::new(ack.node_id, ack.connection_id);
        peer.is_client = ack.client_node;

        if ack.requestor {
            self.handle_ack_as_responder(peer);
        } else {
            self.handle_ack_as_requester(peer, ack.close_ids);
        }
        message.clear();
    }

    /// We initiated; the responder's acknowledgement admits the peer, and
    /// its close-id hints seed further dials.
    fn handle_ack_as_requester(&self, peer: NodeInfo, close_ids: Vec<NodeId>) {
        let outcome = {
            let mut dir = self.directory();
            if dir.contains(&peer.node_id) {
                trace!(peer = %peer.node_id, "duplicate acknowledgement");
                AckOutcome::Ignore
            } else {
                let state = dir
                    .pending(&peer.node_id)
                    .map(|entry| (entry.info.public_key.is_some(), entry.info.connection_id));
                match state {
                    None => {
                        trace!(peer = %peer.node_id, "acknowledgement without pending entry");
                        AckOutcome::Ignore
                    }
                    Some((true, connection_id)) => match dir.confirm_pending(&peer.node_id) {
                        Ok(_) => AckOutcome::Promoted,
                        Err(error) => {
                            debug!(peer = %peer.node_id, %error, "promotion failed");
                            AckOutcome::Teardown(connection_id)
                        }
                    },
                    Some((false, _)) => {
                        // Validator still out; stash the confirmation.
                        dir.note_peer_acknowledged(&peer.node_id, close_ids.clone());
                        AckOutcome::Deferred
                    }
                }
            }
        };

        match outcome {
            AckOutcome::Promoted => {
                for node_id in &close_ids {
                    self.check_and_send_connect_request(node_id);
                }
            }
            AckOutcome::Teardown(connection_id) => {
                self.network.remove(&connection_id);
                self.mark_failed(peer.node_id);
            }
            AckOutcome::Ignore | AckOutcome::Deferred => {}
        }
    }

    /// Deferred promotion once a late validator result lands.
    fn promote_as_requester(&self, node_id: &NodeId, close_ids: Vec<NodeId>) {
        let result = {
            let mut dir = self.directory();
            let connection_id = dir.pending(node_id).map(|entry| entry.info.connection_id);
            dir.confirm_pending(node_id).map_err(|error| (error, connection_id))
        };
        match result {
            Ok(_) => {
                for id in &close_ids {
                    self.check_and_send_connect_request(id);
                }
            }
            Err((error, connection_id)) => {
                debug!(peer = %node_id, %error, "deferred promotion failed");
                if let Some(connection_id) = connection_id {
                    self.network.remove(&connection_id);
                }
            }
        }
    }

    /// We responded; the requester's acknowledgement makes the peer real.
    /// Validate, promote, and send the symmetry-confirming acknowledgement
    /// so the requester promotes too.
    fn handle_ack_as_responder(&self, peer: NodeInfo) {
        let already_admitted = {
            let mut dir = self.directory();
            if dir.contains(&peer.node_id) {
                true
            } else {
                if !dir.pending_contains(&peer.node_id) {
                    // The acknowledgement itself proves the peer finished
                    // its half; start tracking it now.
                    dir.add_pending(peer.clone(), Role::Responder, Stage::Pending);
                }
                false
            }
        };
        if already_admitted {
            // The requester may have missed our earlier acknowledgement.
            self.send_responder_acknowledgement(&peer);
            return;
        }

        let Some(validator) = self.public_key_requester() else {
            warn!(peer = %peer.node_id, "no public key requester configured");
            self.directory().drop_pending(&peer.node_id);
            self.network.remove(&peer.connection_id);
            return;
        };
        let Some(handle) = self.self_handle.upgrade() else {
            return;
        };
        let peer_id = peer.node_id;
        validator(
            peer_id,
            Box::new(move |key| handle.complete_responder_validation(peer, key)),
        );
    }

    fn complete_responder_validation(&self, peer: NodeInfo, key: Option<VerifyingKey>) {
        let Some(key) = key else {
            warn!(peer = %peer.node_id, "public key validation failed");
            self.directory().drop_pending(&peer.node_id);
            self.network.remove(&peer.connection_id);
            self.mark_failed(peer.node_id);
            return;
        };

        let promoted = {
            let mut dir = self.directory();
            dir.note_key_validated(&peer.node_id, key)
                && dir.confirm_pending(&peer.node_id).is_ok()
        };
        if !promoted {
            debug!(peer = %peer.node_id, "responder side promotion failed");
            self.network.remove(&peer.connection_id);
            return;
        }

        self.send_responder_acknowledgement(&peer);
    }

    fn send_responder_acknowledgement(&self, peer: &NodeInfo) {
        let (close_ids, local_id, local_connection_id, client_mode) = {
            let dir = self.directory();
            (
                dir.close_nodes(),
                dir.local_id(),
                dir.connection_id(),
                dir.client_mode(),
            )
        };
        let ack = factory::connect_success_acknowledgement(
            0,
            peer.node_id,
            local_id,
            local_connection_id,
            false,
            close_ids,
            client_mode,
            self.config.hops_to_live,
        );
        self.network
            .send_to_direct(&ack, &peer.node_id, &peer.connection_id);
    }

    /// Resolve a group query against its registered waiter.
    pub fn get_group(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        if let Err(error) = GetGroupResponse::decode(payload) {
            warn!(%error, "unable to parse group response");
            message.clear();
            return;
        }

        if !self.timer.resolve(message) {
            trace!("group response without a waiter");
        }
        message.clear();
    }

    /// A close peer says this client's close group shifted: cache the new
    /// membership and dial the newcomers. Requests already aimed at the
    /// departed members run out their deadlines on their own.
    pub fn close_node_update_for_client(&self, message: &mut Envelope) {
        let Some(payload) = message.payload() else {
            message.clear();
            return;
        };
        let Ok(update) = CloseNodeUpdate::decode(payload) else {
            warn!("unable to parse close node update");
            message.clear();
            return;
        };
        message.clear();

        let (applies, departed, joined) = {
            let mut dir = self.directory();
            if !dir.client_mode() {
                (false, Vec::new(), Vec::new())
            } else {
                let old = dir.set_close_group(update.close_ids.clone());
                let departed: Vec<NodeId> = old
                    .iter()
                    .filter(|id| !update.close_ids.contains(id))
                    .copied()
                    .collect();
                let joined: Vec<NodeId> = update
                    .close_ids
                    .iter()
                    .filter(|id| !old.contains(id))
                    .copied()
                    .collect();
                (true, departed, joined)
            }
        };
        if !applies {
            return;
        }

        for node_id in &departed {
            trace!(peer = %node_id, "close node departed");
            self.recently_failed
                .lock()
                .expect("memo mutex poisoned")
                .pop(node_id);
        }
        for node_id in joined {
            self.check_and_send_connect_request(&node_id);
        }
    }

    // === Densification ===

    /// Dial the peer unless it is us, already known, already in flight or
    /// recently burned.
    pub fn check_and_send_connect_request(&self, node_id: &NodeId) {
        if node_id.is_zero() {
            return;
        }
        {
            let dir = self.directory();
            if *node_id == dir.local_id()
                || dir.contains(node_id)
                || dir.pending_contains(node_id)
            {
                return;
            }
        }
        if self.was_recently_failed(node_id) {
            trace!(peer = %node_id, "skipping recently failed peer");
            return;
        }
        self.send_connect_request(*node_id);
    }

    fn send_connect_request(&self, peer_id: NodeId) {
        let (endpoints, nat_type) =
            match self
                .network
                .get_available_endpoint(&peer_id, &EndpointPair::default())
            {
                Ok(pair) => pair,
                Err(error) => {
                    debug!(%error, "no local endpoint to advertise");
                    return;
                }
            };

        let (local_id, local_connection_id, client_mode, keys) = {
            let dir = self.directory();
            (
                dir.local_id(),
                dir.connection_id(),
                dir.client_mode(),
                dir.keys().clone(),
            )
        };

        let contact = Contact {
            node_id: local_id,
            connection_id: local_connection_id,
            endpoints,
            nat_type,
        };
        let message = factory::connect_request(
            self.timer.new_message_id(),
            peer_id,
            contact,
            client_mode,
            &keys,
            self.config.hops_to_live,
        );

        self.directory().add_pending(
            NodeInfo::new(peer_id, NodeId::ZERO),
            Role::Requester,
            Stage::Dialed,
        );

        trace!(peer = %peer_id, "sending connect request");
        self.network.send_to_closest(&message);
    }

    fn mark_failed(&self, node_id: NodeId) {
        self.recently_failed
            .lock()
            .expect("memo mutex poisoned")
            .put(node_id, Instant::now());
    }

    fn was_recently_failed(&self, node_id: &NodeId) -> bool {
        let mut memo = self.recently_failed.lock().expect("memo mutex poisoned");
        match memo.peek(node_id) {
            Some(failed_at) if failed_at.elapsed() < self.config.failed_peer_backoff => true,
            Some(_) => {
                memo.pop(node_id);
                false
            }
            None => false,
        }
    }
}

impl ResponseHandling for ResponseHandler {
    fn ping(&self, message: &mut Envelope) {
        ResponseHandler::ping(self, message);
    }

    fn connect(&self, message: &mut Envelope) {
        ResponseHandler::connect(self, message);
    }

    fn find_nodes(&self, message: &mut Envelope) {
        ResponseHandler::find_nodes(self, message);
    }

    fn connect_success_acknowledgement(&self, message: &mut Envelope) {
        ResponseHandler::connect_success_acknowledgement(self, message);
    }

    fn get_group(&self, message: &mut Envelope) {
        ResponseHandler::get_group(self, message);
    }

    fn close_node_update_for_client(&self, message: &mut Envelope) {
        ResponseHandler::close_node_update_for_client(self, message);
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::common::messages::{ConnectSuccess, Kind};
    use crate::common::{NatType, ID_SIZE};
    use crate::network::mock::MockNetwork;
    use crate::rpc::KeyReceiver;

    fn id(byte: u8) -> NodeId {
        let mut bytes = [0u8; ID_SIZE];
        bytes[ID_SIZE - 1] = byte;
        NodeId(bytes)
    }

    fn endpoints() -> EndpointPair {
        EndpointPair::new(
            Some("203.0.113.5:5483".parse().unwrap()),
            Some("10.0.0.5:5483".parse().unwrap()),
        )
    }

    struct Fixture {
        handler: Arc<ResponseHandler>,
        network: Arc<MockNetwork>,
        directory: Arc<Mutex<NodeDirectory>>,
        timer: Arc<Timer>,
        local_id: NodeId,
    }

    fn fixture(local_id: NodeId) -> Fixture {
        let keys = SigningKey::generate(&mut OsRng);
        let config = Config::default();
        let timer = Arc::new(Timer::new(config.request_timeout));
        let directory = Arc::new(Mutex::new(NodeDirectory::new(
            config,
            keys,
            local_id,
            false,
        )));
        let network = Arc::new(MockNetwork::new());
        let handler = ResponseHandler::new(
            directory.clone(),
            network.clone() as Arc<dyn Network>,
            timer.clone(),
        );
        Fixture {
            handler,
            network,
            directory,
            timer,
            local_id,
        }
    }

    fn instant_validator(key: VerifyingKey) -> PublicKeyRequester {
        Arc::new(move |_, receiver: KeyReceiver| receiver(Some(key)))
    }

    fn missing_validator() -> PublicKeyRequester {
        Arc::new(|_, receiver: KeyReceiver| receiver(None))
    }

    /// Collects continuations so the test can fire them later.
    #[allow(clippy::type_complexity)]
    fn manual_validator() -> (PublicKeyRequester, Arc<Mutex<Vec<(NodeId, KeyReceiver)>>>) {
        let parked: Arc<Mutex<Vec<(NodeId, KeyReceiver)>>> = Arc::new(Mutex::new(Vec::new()));
        let inner = parked.clone();
        (
            Arc::new(move |node_id, receiver: KeyReceiver| {
                inner.lock().unwrap().push((node_id, receiver));
            }),
            parked,
        )
    }

    fn connect_response_envelope(fx: &Fixture, peer_byte: u8) -> (Envelope, NodeId) {
        let peer_connection = NodeId::random();
        let contact = Contact {
            node_id: id(peer_byte),
            connection_id: peer_connection,
            endpoints: endpoints(),
            nat_type: NatType::Cone,
        };
        let request = Envelope {
            id: 40,
            kind: Kind::Connect,
            source_id: Some(fx.local_id),
            destination_id: Some(id(peer_byte)),
            request: true,
            ..Envelope::default()
        };
        (
            factory::connect_response(&request, Some(contact), id(peer_byte), false, 20),
            peer_connection,
        )
    }

    fn dial(fx: &Fixture, peer_byte: u8) {
        fx.directory.lock().unwrap().add_pending(
            NodeInfo::new(id(peer_byte), NodeId::ZERO),
            Role::Requester,
            Stage::Dialed,
        );
    }

    #[test]
    fn connect_walks_all_three_gates() {
        let fx = fixture(id(1));
        let peer_key = SigningKey::generate(&mut OsRng).verifying_key();
        fx.handler.set_public_key_requester(instant_validator(peer_key));
        dial(&fx, 9);

        let (mut response, _) = connect_response_envelope(&fx, 9);
        fx.handler.connect(&mut response);

        // Transport gate.
        let added = fx.network.added_connections();
        assert_eq!(added.len(), 1);
        assert!(added[0].requestor);

        // Handshake gate: success announced over the association.
        let direct = fx.network.direct_sent();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0.kind, Kind::ConnectSuccess);
        let success = ConnectSuccess::decode(direct[0].0.payload().unwrap()).unwrap();
        assert!(success.requestor);

        // Key gate left its mark on the ledger.
        let dir = fx.directory.lock().unwrap();
        let entry = dir.pending(&id(9)).unwrap();
        assert_eq!(entry.stage, Stage::SuccessSent);
        assert_eq!(entry.info.public_key, Some(peer_key));
    }

    #[test]
    fn connect_discards_refusal() {
        let fx = fixture(id(1));
        dial(&fx, 9);

        let request = Envelope {
            id: 40,
            kind: Kind::Connect,
            source_id: Some(fx.local_id),
            destination_id: Some(id(9)),
            request: true,
            ..Envelope::default()
        };
        let mut response = factory::connect_response(&request, None, id(9), false, 20);
        fx.handler.connect(&mut response);

        assert!(fx.network.added_connections().is_empty());
        assert!(!fx.directory.lock().unwrap().pending_contains(&id(9)));
        // The refuser is remembered and skipped.
        fx.handler.check_and_send_connect_request(&id(9));
        assert!(fx.network.routed_sent().is_empty());
    }

    #[test]
    fn connect_ignores_response_without_dial() {
        let fx = fixture(id(1));
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        fx.handler.set_public_key_requester(instant_validator(key));

        let (mut response, _) = connect_response_envelope(&fx, 9);
        fx.handler.connect(&mut response);

        assert!(fx.network.added_connections().is_empty());
    }

    #[test]
    fn connect_tears_down_on_validation_failure() {
        let fx = fixture(id(1));
        fx.handler.set_public_key_requester(missing_validator());
        dial(&fx, 9);

        let (mut response, peer_connection) = connect_response_envelope(&fx, 9);
        fx.handler.connect(&mut response);

        // Transport reserved, then released on the failed key gate.
        assert_eq!(fx.network.added_connections().len(), 1);
        assert_eq!(fx.network.removed_connections(), vec![peer_connection]);
        assert!(!fx.directory.lock().unwrap().pending_contains(&id(9)));

        // And the densification loop now skips the peer.
        fx.handler.check_and_send_connect_request(&id(9));
        assert!(fx.network.routed_sent().is_empty());
    }

    #[test]
    fn connect_gives_up_after_bounded_retries() {
        let fx = fixture(id(1));
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        fx.handler.set_public_key_requester(instant_validator(key));
        fx.network
            .fail_add
            .store(true, std::sync::atomic::Ordering::SeqCst);
        dial(&fx, 9);

        let (mut response, _) = connect_response_envelope(&fx, 9);
        fx.handler.connect(&mut response);

        assert!(!fx.directory.lock().unwrap().pending_contains(&id(9)));
        assert!(fx.network.direct_sent().is_empty());
    }

    #[test]
    fn ack_as_requester_promotes_and_densifies() {
        let fx = fixture(id(1));
        let peer_key = SigningKey::generate(&mut OsRng).verifying_key();
        fx.handler.set_public_key_requester(instant_validator(peer_key));
        dial(&fx, 9);

        let (mut response, peer_connection) = connect_response_envelope(&fx, 9);
        fx.handler.connect(&mut response);

        let mut ack = factory::connect_success_acknowledgement(
            0,
            fx.local_id,
            id(9),
            peer_connection,
            false,
            vec![id(5), id(6)],
            false,
            20,
        );
        fx.handler.connect_success_acknowledgement(&mut ack);

        assert!(ack.is_cleared());
        {
            let dir = fx.directory.lock().unwrap();
            assert!(dir.contains(&id(9)));
            assert!(!dir.pending_contains(&id(9)));
            // Hinted ids are now being dialed.
            assert!(dir.pending_contains(&id(5)));
            assert!(dir.pending_contains(&id(6)));
        }
        assert_eq!(fx.network.routed_sent().len(), 2);
    }

    #[test]
    fn early_ack_defers_until_validation() {
        let fx = fixture(id(1));
        let (validator, parked) = manual_validator();
        fx.handler.set_public_key_requester(validator);
        dial(&fx, 9);

        let (mut response, peer_connection) = connect_response_envelope(&fx, 9);
        fx.handler.connect(&mut response);

        // The ack arrives while the validator is still out.
        let mut ack = factory::connect_success_acknowledgement(
            0,
            fx.local_id,
            id(9),
            peer_connection,
            false,
            vec![id(5)],
            false,
            20,
        );
        fx.handler.connect_success_acknowledgement(&mut ack);
        assert!(!fx.directory.lock().unwrap().contains(&id(9)));

        // Validator lands: promotion and densification follow.
        let peer_key = SigningKey::generate(&mut OsRng).verifying_key();
        let (node_id, receiver) = parked.lock().unwrap().pop().unwrap();
        assert_eq!(node_id, id(9));
        receiver(Some(peer_key));

        let dir = fx.directory.lock().unwrap();
        assert!(dir.contains(&id(9)));
        assert!(dir.pending_contains(&id(5)));
    }

    #[test]
    fn ack_as_responder_validates_promotes_and_replies() {
        let fx = fixture(id(1));
        let peer_key = SigningKey::generate(&mut OsRng).verifying_key();
        fx.handler.set_public_key_requester(instant_validator(peer_key));

        // The peer's connect success parked it in the ledger earlier.
        let peer_connection = NodeId::random();
        fx.directory.lock().unwrap().add_pending(
            NodeInfo::new(id(9), peer_connection),
            Role::Responder,
            Stage::Pending,
        );

        let mut ack = factory::connect_success_acknowledgement(
            0,
            fx.local_id,
            id(9),
            peer_connection,
            true,
            Vec::new(),
            false,
            20,
        );
        fx.handler.connect_success_acknowledgement(&mut ack);

        assert!(fx.directory.lock().unwrap().contains(&id(9)));

        // The symmetry-confirming acknowledgement went back.
        let direct = fx.network.direct_sent();
        assert_eq!(direct.len(), 1);
        let payload = ConnectSuccessAck::decode(direct[0].0.payload().unwrap()).unwrap();
        assert!(!payload.requestor);
    }

    #[test]
    fn find_nodes_dials_only_new_peers() {
        let fx = fixture(id(1));
        {
            let mut dir = fx.directory.lock().unwrap();
            let mut known = NodeInfo::new(id(3), NodeId::random());
            known.public_key = Some(SigningKey::generate(&mut OsRng).verifying_key());
            dir.add_pending(known, Role::Requester, Stage::SuccessSent);
            dir.confirm_pending(&id(3)).unwrap();
        }

        let request = Envelope {
            id: 11,
            kind: Kind::FindNodes,
            source_id: Some(fx.local_id),
            destination_id: Some(id(9)),
            request: true,
            ..Envelope::default()
        };
        let mut response = factory::find_nodes_response(
            &request,
            vec![fx.local_id, id(3), id(5)],
            id(9),
            false,
            20,
        );
        fx.handler.find_nodes(&mut response);

        // Only the genuinely new peer got dialed.
        let dir = fx.directory.lock().unwrap();
        assert!(dir.pending_contains(&id(5)));
        assert!(!dir.pending_contains(&id(3)));
        assert_eq!(fx.network.routed_sent().len(), 1);
    }

    #[test]
    fn get_group_resolves_waiter() {
        let fx = fixture(id(1));
        let (tx, rx) = std::sync::mpsc::channel();

        let message_id = fx.timer.new_message_id();
        fx.timer.add(
            message_id,
            Box::new(move |result| {
                let envelope = result.unwrap();
                let group = GetGroupResponse::decode(envelope.payload().unwrap())
                    .unwrap()
                    .group;
                tx.send(group).unwrap();
            }),
        );

        let request = Envelope {
            id: message_id,
            kind: Kind::GetGroup,
            source_id: Some(fx.local_id),
            destination_id: Some(id(9)),
            request: true,
            ..Envelope::default()
        };
        let mut response =
            factory::get_group_response(&request, vec![id(4), id(5)], id(9), 20);
        fx.handler.get_group(&mut response);

        assert_eq!(rx.recv().unwrap(), vec![id(4), id(5)]);
        assert!(response.is_cleared());
    }

    #[test]
    fn close_node_update_refreshes_group_and_dials_joiners() {
        let keys = SigningKey::generate(&mut OsRng);
        let config = Config::default();
        let timer = Arc::new(Timer::new(config.request_timeout));
        let directory = Arc::new(Mutex::new(NodeDirectory::new(config, keys, id(1), true)));
        let network = Arc::new(MockNetwork::new());
        let handler = ResponseHandler::new(
            directory.clone(),
            network.clone() as Arc<dyn Network>,
            timer,
        );

        directory
            .lock()
            .unwrap()
            .set_close_group(vec![id(4), id(5)]);

        let mut update = factory::close_node_update(0, id(1), id(9), vec![id(5), id(6)], 20);
        handler.close_node_update_for_client(&mut update);

        let dir = directory.lock().unwrap();
        assert_eq!(dir.close_group(), &[id(5), id(6)]);
        // The newcomer is being dialed, the survivor is not re-dialed.
        assert!(dir.pending_contains(&id(6)));
        assert!(!dir.pending_contains(&id(5)));
    }

    #[test]
    fn close_node_update_is_server_noop() {
        let fx = fixture(id(1));
        let mut update = factory::close_node_update(0, id(1), id(9), vec![id(6)], 20);
        fx.handler.close_node_update_for_client(&mut update);

        assert!(fx.directory.lock().unwrap().close_group().is_empty());
        assert!(fx.network.routed_sent().is_empty());
    }
}
