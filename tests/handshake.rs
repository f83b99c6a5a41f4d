//! End-to-end exercises of the connect handshake and bootstrap
//! densification, with whole nodes wired together over an in-memory
//! transport. Every frame goes through the real codec on the way.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use overline::messages::{Envelope, PingResponse, WirePayload};
use overline::rpc::factory;
use overline::{
    AddConnection, Config, EndpointPair, NatType, Network, NetworkError, NodeId, Overlay,
    PublicKeyRequester, ID_SIZE,
};

fn id(byte: u8) -> NodeId {
    let mut bytes = [0u8; ID_SIZE];
    bytes[ID_SIZE - 1] = byte;
    NodeId(bytes)
}

/// Frame switchboard: looks up the destination overlay and feeds it the
/// encoded frame, synchronously.
#[derive(Default)]
struct Router {
    peers: Mutex<HashMap<NodeId, Arc<Overlay>>>,
}

impl Router {
    fn register(&self, overlay: Arc<Overlay>) {
        self.peers
            .lock()
            .unwrap()
            .insert(overlay.local_id(), overlay);
    }

    fn deliver(&self, to: &NodeId, frame: &[u8]) {
        let target = self.peers.lock().unwrap().get(to).cloned();
        if let Some(target) = target {
            target.handle_packet(frame).unwrap();
        }
    }
}

/// One node's view of the transport: associations are bookkeeping, frames
/// go straight to the destination node.
struct LoopbackNetwork {
    router: Arc<Router>,
    associations: Mutex<Vec<NodeId>>,
    removed: Mutex<Vec<NodeId>>,
}

impl LoopbackNetwork {
    fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            associations: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    fn removed_connections(&self) -> Vec<NodeId> {
        self.removed.lock().unwrap().clone()
    }
}

impl Network for LoopbackNetwork {
    fn get_available_endpoint(
        &self,
        _peer_connection_id: &NodeId,
        _peer_endpoints: &EndpointPair,
    ) -> Result<(EndpointPair, NatType), NetworkError> {
        Ok((
            EndpointPair::new(
                Some(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 77), 5483)),
                Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 77), 5483)),
            ),
            NatType::Cone,
        ))
    }

    fn add(&self, conn: AddConnection) -> Result<(), NetworkError> {
        self.associations.lock().unwrap().push(conn.peer_connection_id);
        Ok(())
    }

    fn remove(&self, peer_connection_id: &NodeId) {
        self.removed.lock().unwrap().push(*peer_connection_id);
        self.associations
            .lock()
            .unwrap()
            .retain(|conn| conn != peer_connection_id);
    }

    fn send_to_direct(&self, message: &Envelope, peer_id: &NodeId, _peer_connection_id: &NodeId) {
        let frame = message.to_bytes().unwrap();
        self.router.deliver(peer_id, &frame);
    }

    fn send_to_closest(&self, message: &Envelope) {
        if let Some(destination) = message.destination_id {
            let frame = message.to_bytes().unwrap();
            self.router.deliver(&destination, &frame);
        }
    }
}

/// Shared key registry standing in for the identity layer.
#[derive(Default)]
struct Keyring {
    keys: Mutex<HashMap<NodeId, VerifyingKey>>,
}

impl Keyring {
    fn forget(&self, node_id: &NodeId) {
        self.keys.lock().unwrap().remove(node_id);
    }
}

fn key_requester(keyring: &Arc<Keyring>) -> PublicKeyRequester {
    let keyring = keyring.clone();
    Arc::new(move |node_id, receiver| {
        let key = keyring.keys.lock().unwrap().get(&node_id).copied();
        receiver(key);
    })
}

struct TestNode {
    overlay: Arc<Overlay>,
    network: Arc<LoopbackNetwork>,
    keys: SigningKey,
}

impl TestNode {
    fn table_contains(&self, node_id: &NodeId) -> bool {
        self.overlay.directory().lock().unwrap().contains(node_id)
    }

    fn dial(&self, peer: &NodeId) {
        self.overlay
            .response_handler()
            .check_and_send_connect_request(peer);
    }
}

fn spawn_node(router: &Arc<Router>, keyring: &Arc<Keyring>, byte: u8) -> TestNode {
    let keys = SigningKey::generate(&mut OsRng);
    let local_id = id(byte);
    keyring
        .keys
        .lock()
        .unwrap()
        .insert(local_id, keys.verifying_key());

    let network = Arc::new(LoopbackNetwork::new(router.clone()));
    let overlay = Arc::new(Overlay::new(
        Config::default(),
        keys.clone(),
        local_id,
        false,
        network.clone() as Arc<dyn Network>,
    ));
    overlay.set_public_key_requester(key_requester(keyring));
    router.register(overlay.clone());

    TestNode {
        overlay,
        network,
        keys,
    }
}

#[test]
fn four_message_handshake_admits_both_sides() {
    let router = Arc::new(Router::default());
    let keyring = Arc::new(Keyring::default());
    let a = spawn_node(&router, &keyring, 10);
    let b = spawn_node(&router, &keyring, 20);

    a.dial(&b.overlay.local_id());

    // B is in A's table iff A is in B's table.
    assert!(a.table_contains(&b.overlay.local_id()));
    assert!(b.table_contains(&a.overlay.local_id()));
    assert_eq!(a.overlay.table_size(), 1);
    assert_eq!(b.overlay.table_size(), 1);

    // Nothing left in flight on either ledger.
    assert!(!a
        .overlay
        .directory()
        .lock()
        .unwrap()
        .pending_contains(&b.overlay.local_id()));
    assert!(!b
        .overlay
        .directory()
        .lock()
        .unwrap()
        .pending_contains(&a.overlay.local_id()));
}

#[test]
fn redial_of_connected_peer_is_a_noop() {
    let router = Arc::new(Router::default());
    let keyring = Arc::new(Keyring::default());
    let a = spawn_node(&router, &keyring, 10);
    let b = spawn_node(&router, &keyring, 20);

    a.dial(&b.overlay.local_id());
    a.dial(&b.overlay.local_id());
    b.dial(&a.overlay.local_id());

    assert_eq!(a.overlay.table_size(), 1);
    assert_eq!(b.overlay.table_size(), 1);
}

#[test]
fn key_validation_failure_admits_nobody() {
    let router = Arc::new(Router::default());
    let keyring = Arc::new(Keyring::default());
    let a = spawn_node(&router, &keyring, 10);
    let b = spawn_node(&router, &keyring, 20);

    // The identity layer has no key for B.
    keyring.forget(&b.overlay.local_id());

    a.dial(&b.overlay.local_id());

    assert_eq!(a.overlay.table_size(), 0);
    assert_eq!(b.overlay.table_size(), 0);

    // A reserved an association for B and released it again.
    assert_eq!(
        a.network.removed_connections(),
        vec![b.overlay.connection_id()]
    );
}

#[test]
fn ping_round_trip_changes_no_state() {
    let router = Arc::new(Router::default());
    let keyring = Arc::new(Keyring::default());
    let a = spawn_node(&router, &keyring, 10);
    let b = spawn_node(&router, &keyring, 20);

    let message_id = a.overlay.timer().new_message_id();
    let (tx, rx) = std::sync::mpsc::channel();
    a.overlay.timer().add(
        message_id,
        Box::new(move |result| {
            let envelope = result.unwrap();
            let pong = PingResponse::decode(envelope.payload().unwrap()).unwrap();
            tx.send(pong).unwrap();
        }),
    );

    let ping = factory::ping_request(
        message_id,
        b.overlay.local_id(),
        a.overlay.local_id(),
        &a.keys,
        20,
    );
    a.network.send_to_closest(&ping);

    let pong = rx.recv().unwrap();
    assert!(pong.pong);
    assert_eq!(a.overlay.table_size(), 0);
    assert_eq!(b.overlay.table_size(), 0);
}

#[test]
fn bootstrap_densifies_from_a_single_contact() {
    let router = Arc::new(Router::default());
    let keyring = Arc::new(Keyring::default());

    // A small standing network around the bootstrap contact.
    let bootstrap = spawn_node(&router, &keyring, 100);
    let others: Vec<TestNode> = (1u8..=5)
        .map(|byte| spawn_node(&router, &keyring, byte * 10))
        .collect();
    for node in &others {
        node.dial(&bootstrap.overlay.local_id());
    }
    assert_eq!(bootstrap.overlay.table_size(), 5);

    // A fresh node knows only the bootstrap contact.
    let newcomer = spawn_node(&router, &keyring, 7);
    newcomer
        .overlay
        .bootstrap(&bootstrap.overlay.local_id(), &bootstrap.overlay.connection_id());

    // The single discovery answer fanned out into a full neighborhood.
    assert_eq!(newcomer.overlay.table_size(), 6);
    assert!(newcomer.table_contains(&bootstrap.overlay.local_id()));
    for node in &others {
        assert!(newcomer.table_contains(&node.overlay.local_id()));
        assert!(node.table_contains(&newcomer.overlay.local_id()));
    }
}

#[test]
fn mutual_dial_settles_symmetrically() {
    let router = Arc::new(Router::default());
    let keyring = Arc::new(Keyring::default());
    let a = spawn_node(&router, &keyring, 10);
    let b = spawn_node(&router, &keyring, 20);

    a.dial(&b.overlay.local_id());
    b.dial(&a.overlay.local_id());

    assert_eq!(a.overlay.table_size(), 1);
    assert_eq!(b.overlay.table_size(), 1);
    assert!(a.table_contains(&b.overlay.local_id()));
    assert!(b.table_contains(&a.overlay.local_id()));
}
