//! The routing core: request/response handlers and their owning container.
//!
//! [`Overlay`] owns the directory, the transport handle, the timer and
//! both handler halves; the handlers hold references downward only. An
//! inbound packet flows transport → codec → [`Overlay::handle_message`] →
//! (request ? [`Service`] : [`ResponseHandler`]) → mutated envelope →
//! transport send, skipped when the envelope was cleared.

pub mod factory;
mod response;
mod service;
mod timer;

pub use response::ResponseHandler;
pub use service::Service;
pub use timer::{Timer, Waiter};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::{debug, trace, warn};

use crate::common::messages::{Envelope, GetGroupResponse, Kind, WirePayload};
use crate::common::NodeId;
use crate::config::Config;
use crate::directory::NodeDirectory;
use crate::network::Network;
use crate::Result;

/// Continuation handed to the public-key validator.
pub type KeyReceiver = Box<dyn FnOnce(Option<VerifyingKey>) + Send>;

/// Asynchronous public-key lookup. The validator resolves a node id to its
/// key on its own executor and must not be called back under any component
/// lock.
pub type PublicKeyRequester = Arc<dyn Fn(NodeId, KeyReceiver) + Send + Sync>;

/// The inbound-request capability set, substitutable in tests.
pub trait RequestHandling: Send + Sync {
    fn ping(&self, message: &mut Envelope);
    fn connect(&self, message: &mut Envelope);
    fn find_nodes(&self, message: &mut Envelope);
    fn connect_success(&self, message: &mut Envelope);
}

/// The inbound-response capability set, substitutable in tests.
pub trait ResponseHandling: Send + Sync {
    fn ping(&self, message: &mut Envelope);
    fn connect(&self, message: &mut Envelope);
    fn find_nodes(&self, message: &mut Envelope);
    fn connect_success_acknowledgement(&self, message: &mut Envelope);
    fn get_group(&self, message: &mut Envelope);
    fn close_node_update_for_client(&self, message: &mut Envelope);
}

/// One node's routing core.
pub struct Overlay {
    config: Config,
    directory: Arc<Mutex<NodeDirectory>>,
    network: Arc<dyn Network>,
    timer: Arc<Timer>,
    service: Arc<Service>,
    responses: Arc<ResponseHandler>,
    last_probe: Mutex<Option<Instant>>,
}

impl Overlay {
    pub fn new(
        config: Config,
        keys: SigningKey,
        local_id: NodeId,
        client_mode: bool,
        network: Arc<dyn Network>,
    ) -> Self {
        let timer = Arc::new(Timer::new(config.request_timeout));
        let directory = Arc::new(Mutex::new(NodeDirectory::new(
            config.clone(),
            keys,
            local_id,
            client_mode,
        )));
        let service = Arc::new(Service::new(directory.clone(), network.clone()));
        let responses = ResponseHandler::new(directory.clone(), network.clone(), timer.clone());

        Self {
            config,
            directory,
            network,
            timer,
            service,
            responses,
            last_probe: Mutex::new(None),
        }
    }

    fn locked_directory(&self) -> MutexGuard<'_, NodeDirectory> {
        self.directory.lock().expect("directory mutex poisoned")
    }

    // === Getters ===

    pub fn local_id(&self) -> NodeId {
        self.locked_directory().local_id()
    }

    pub fn connection_id(&self) -> NodeId {
        self.locked_directory().connection_id()
    }

    pub fn client_mode(&self) -> bool {
        self.locked_directory().client_mode()
    }

    /// Number of server peers currently in the routing table.
    pub fn table_size(&self) -> usize {
        self.locked_directory().len()
    }

    pub fn directory(&self) -> &Arc<Mutex<NodeDirectory>> {
        &self.directory
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn response_handler(&self) -> &Arc<ResponseHandler> {
        &self.responses
    }

    /// Install the key validator on both handler halves.
    pub fn set_public_key_requester(&self, requester: PublicKeyRequester) {
        self.service.set_public_key_requester(requester.clone());
        self.responses.set_public_key_requester(requester);
    }

    // === Dispatch ===

    /// Decode one wire frame and run it through the core.
    pub fn handle_packet(&self, bytes: &[u8]) -> Result<()> {
        let mut message = Envelope::from_bytes(bytes)?;
        self.handle_message(&mut message);
        Ok(())
    }

    /// Demultiplex an inbound envelope into the right handler and send the
    /// mutated reply, if the handler left one.
    pub fn handle_message(&self, message: &mut Envelope) {
        if message.request {
            let service: &dyn RequestHandling = self.service.as_ref();
            match message.kind {
                Kind::Ping => service.ping(message),
                Kind::Connect => service.connect(message),
                Kind::FindNodes => service.find_nodes(message),
                Kind::ConnectSuccess => service.connect_success(message),
                other => {
                    debug!(kind = ?other, "unroutable request");
                    message.clear();
                }
            }
            if !message.is_cleared() {
                self.network.send_to_closest(message);
            }
        } else {
            let responses: &dyn ResponseHandling = self.responses.as_ref();
            match message.kind {
                Kind::Ping => responses.ping(message),
                Kind::Connect => responses.connect(message),
                Kind::FindNodes => responses.find_nodes(message),
                Kind::ConnectSuccessAck => responses.connect_success_acknowledgement(message),
                Kind::GetGroup => responses.get_group(message),
                Kind::CloseNodeUpdate => responses.close_node_update_for_client(message),
                other => debug!(kind = ?other, "unroutable response"),
            }
        }
    }

    // === Queries ===

    /// Ask a bootstrap contact for our own neighborhood. Responses feed
    /// the densification loop in the response half.
    pub fn bootstrap(&self, peer_id: &NodeId, peer_connection_id: &NodeId) {
        let (local_id, keys) = {
            let dir = self.locked_directory();
            (dir.local_id(), dir.keys().clone())
        };

        let message_id = self.timer.new_message_id();
        let message = factory::find_nodes_request(
            message_id,
            *peer_id,
            local_id,
            self.config.closest_nodes_size as u32 + 1,
            local_id,
            &keys,
            self.config.hops_to_live,
        );

        let contact = *peer_id;
        self.timer.add(
            message_id,
            Box::new(move |result| {
                if result.is_err() {
                    warn!(peer = %contact, "bootstrap discovery timed out");
                }
            }),
        );
        self.network
            .send_to_direct(&message, peer_id, peer_connection_id);
    }

    /// Resolve the group closest to `target`. The receiver yields the
    /// group once, or disconnects on timeout.
    pub fn find_group(&self, target: NodeId) -> flume::Receiver<Vec<NodeId>> {
        let (tx, rx) = flume::bounded(1);
        let (local_id, keys) = {
            let dir = self.locked_directory();
            (dir.local_id(), dir.keys().clone())
        };

        let message_id = self.timer.new_message_id();
        self.timer.add(
            message_id,
            Box::new(move |result| match result {
                Ok(envelope) => {
                    let Some(payload) = envelope.payload() else {
                        return;
                    };
                    if let Ok(response) = GetGroupResponse::decode(payload) {
                        let _ = tx.send(response.group);
                    }
                }
                // Dropping the sender disconnects the receiver.
                Err(error) => trace!(%error, "group query expired"),
            }),
        );

        let message = factory::get_group_request(
            message_id,
            target,
            local_id,
            &keys,
            self.config.hops_to_live,
        );
        self.network.send_to_closest(&message);
        rx
    }

    // === Maintenance ===

    /// One maintenance pass: expire outstanding requests, age out the
    /// handshake ledger, and keep probing while under-connected.
    pub fn tick(&self) {
        self.timer.expire();

        let expired = self.locked_directory().expire_pending(self.config.pending_ttl);
        for entry in expired {
            debug!(peer = %entry.info.node_id, stage = ?entry.stage, "pending peer expired");
            if !entry.info.connection_id.is_zero() {
                self.network.remove(&entry.info.connection_id);
            }
        }

        self.probe_if_sparse();
    }

    /// Remove a peer reported gone by the churn detector.
    pub fn drop_peer(&self, node_id: &NodeId) {
        let connections = self.locked_directory().remove_node(node_id);
        for connection_id in &connections {
            self.network.remove(connection_id);
        }
    }

    /// While the close group is not yet populated, keep asking the
    /// neighborhood about our own id.
    fn probe_if_sparse(&self) {
        let (size, local_id, keys) = {
            let dir = self.locked_directory();
            (dir.len(), dir.local_id(), dir.keys().clone())
        };
        if size == 0 || size >= self.config.closest_nodes_size {
            return;
        }

        {
            let mut last_probe = self.last_probe.lock().expect("probe mutex poisoned");
            let due = last_probe
                .map(|at| at.elapsed() >= self.config.request_timeout)
                .unwrap_or(true);
            if !due {
                return;
            }
            *last_probe = Some(Instant::now());
        }

        trace!(table_size = size, "probing for a denser neighborhood");
        let message = factory::find_nodes_request(
            self.timer.new_message_id(),
            local_id,
            local_id,
            self.config.closest_nodes_size as u32 + 1,
            local_id,
            &keys,
            self.config.hops_to_live,
        );
        self.network.send_to_closest(&message);
    }
}
