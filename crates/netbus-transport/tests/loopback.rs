//! Real sockets on the loopback interface.
//!
//! Each test uses its own fixed listen port (the unreliable half sits on
//! port + 1), so the tests can run in parallel.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netbus_bus::MessageServer;
use netbus_protocol::{
    Address, ConnectOrigin, ConnectedMessage, ConnectionFailedMessage, DisconnectedMessage,
    Message, PassthroughFactory, PeerId, TypedMessage, address::defines, message_id,
};
use netbus_transport::{PeerState, SocketKind, SocketManager, SocketManagerConfig};

const PING: u32 = message_id("Ping");

// =========================================================================
// Helpers
// =========================================================================

struct Node {
    bus: Arc<MessageServer>,
    manager: SocketManager,
    connected: Arc<Mutex<Vec<ConnectedMessage>>>,
    disconnected: Arc<Mutex<Vec<PeerId>>>,
    failed: Arc<Mutex<Vec<PeerId>>>,
    pings: Arc<Mutex<Vec<(Option<PeerId>, String)>>>,
}

impl Node {
    fn start() -> Self {
        let bus = Arc::new(MessageServer::default());
        let config = SocketManagerConfig {
            connect_timeout: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(10),
            ..SocketManagerConfig::default()
        };
        let manager =
            SocketManager::start(config, Arc::clone(&bus), Arc::new(PassthroughFactory)).unwrap();

        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&connected);
        bus.add_message_receiver(ConnectedMessage::ID, move |msg| {
            sink.lock().unwrap().push(ConnectedMessage::from_message(msg).unwrap());
        });

        let disconnected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&disconnected);
        bus.add_message_receiver(DisconnectedMessage::ID, move |msg| {
            sink.lock()
                .unwrap()
                .push(DisconnectedMessage::from_message(msg).unwrap().peer_id);
        });

        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failed);
        bus.add_message_receiver(ConnectionFailedMessage::ID, move |msg| {
            sink.lock()
                .unwrap()
                .push(ConnectionFailedMessage::from_message(msg).unwrap().peer_id);
        });

        let pings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pings);
        bus.add_message_receiver(PING, move |msg| {
            let text = msg.reader().read_string().unwrap();
            sink.lock().unwrap().push((msg.origin(), text));
        });

        Self {
            bus,
            manager,
            connected,
            disconnected,
            failed,
            pings,
        }
    }

    fn connect(&self, host: &str, port: u16) -> PeerId {
        let sockets = self
            .manager
            .registry()
            .create_peer(Address::resolve(host, port).unwrap())
            .unwrap();
        let id = sockets.peer_id;
        self.manager.register_peer_sockets(sockets);
        id
    }

    /// Dispatches until `done` holds, for at most five seconds.
    fn pump_until(&self, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            self.bus.dispatch_messages();
            if done(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

fn ping(text: &str) -> Message {
    let mut msg = Message::new(PING);
    msg.packet_mut().write_str(text);
    msg
}

// =========================================================================
// Tests
// =========================================================================

#[test]
fn test_connect_without_listener_fails() {
    let node = Node::start();
    let id = node.connect(defines::LOCALHOST_IPV4, 47_390);

    assert!(node.pump_until(|n| n.failed.lock().unwrap().contains(&id)));
    assert!(!node.manager.registry().contains(id));
    assert!(node.connected.lock().unwrap().is_empty());
}

#[test]
fn test_listen_accept_and_exchange_both_halves() {
    let server = Node::start();
    let client = Node::start();

    let listener = server.connect(defines::ANY_IPV4, 47_310);
    assert!(server.pump_until(|n| !n.connected.lock().unwrap().is_empty()));
    assert_eq!(
        server.connected.lock().unwrap()[0].origin,
        ConnectOrigin::Listening
    );

    let remote = client.connect(defines::LOCALHOST_IPV4, 47_310);
    assert!(client.pump_until(|n| !n.connected.lock().unwrap().is_empty()));
    assert_eq!(client.connected.lock().unwrap()[0].origin, ConnectOrigin::Outbound);
    assert_eq!(
        client.manager.registry().state(remote),
        Some(PeerState::Unvalidated)
    );

    // The server sees the client as a brand new peer.
    assert!(server.pump_until(|n| n.connected.lock().unwrap().len() == 2));
    let accepted = server.connected.lock().unwrap()[1].clone();
    assert_eq!(accepted.origin, ConnectOrigin::Accepted { listener });
    assert_ne!(accepted.peer_id, listener);

    // Reliable, client to server.
    assert!(client.manager.registry().send(remote, SocketKind::Reliable, ping("tcp")));
    assert!(server.pump_until(|n| !n.pings.lock().unwrap().is_empty()));
    assert_eq!(
        server.pings.lock().unwrap()[0],
        (Some(accepted.peer_id), "tcp".to_string())
    );

    // Unreliable, server to client. Loopback doesn't drop, but retry anyway.
    let delivered = client.pump_until(|n| {
        server
            .manager
            .registry()
            .send(accepted.peer_id, SocketKind::Unreliable, ping("udp"));
        n.pings.lock().unwrap().iter().any(|(_, text)| text == "udp")
    });
    assert!(delivered);
    assert_eq!(client.pings.lock().unwrap()[0].0, Some(remote));

    // Unreliable, client to server, attributed by sender address.
    let delivered = server.pump_until(|n| {
        client
            .manager
            .registry()
            .send(remote, SocketKind::Unreliable, ping("udp-up"));
        n.pings.lock().unwrap().iter().any(|(_, text)| text == "udp-up")
    });
    assert!(delivered);
    assert!(
        server
            .pings
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, text)| text == "udp-up")
            .all(|(origin, _)| *origin == Some(accepted.peer_id))
    );

    // Closing the client side shows up as a disconnect on both ends.
    client.manager.disconnect_peer(remote);
    assert!(client.pump_until(|n| n.disconnected.lock().unwrap().contains(&remote)));
    assert!(!client.manager.registry().contains(remote));
    assert!(server.pump_until(|n| n.disconnected.lock().unwrap().contains(&accepted.peer_id)));
}

#[test]
fn test_disconnect_all_closes_live_peers() {
    let server = Node::start();
    let client = Node::start();

    server.connect(defines::ANY_IPV4, 47_320);
    assert!(server.pump_until(|n| !n.connected.lock().unwrap().is_empty()));

    let first = client.connect(defines::LOCALHOST_IPV4, 47_320);
    assert!(client.pump_until(|n| !n.connected.lock().unwrap().is_empty()));

    client.manager.disconnect_all().unwrap();
    assert!(client.pump_until(|n| n.disconnected.lock().unwrap().contains(&first)));
    assert!(client.manager.registry().is_empty());
}

#[test]
fn test_disconnect_all_fails_every_pending_connect() {
    let node = Node::start();
    // Nobody listens here. Whether a dial is cancelled in the queue or
    // refused on the socket thread, it must end as a failure exactly once.
    let ids: Vec<PeerId> = (0..20)
        .map(|_| node.connect(defines::LOCALHOST_IPV4, 47_395))
        .collect();

    node.manager.disconnect_all().unwrap();

    assert!(node.pump_until(|n| n.failed.lock().unwrap().len() >= ids.len()));
    let mut failed = node.failed.lock().unwrap().clone();
    failed.sort();
    assert_eq!(failed, ids);
    assert!(node.connected.lock().unwrap().is_empty());
    assert!(node.disconnected.lock().unwrap().is_empty());
    assert!(node.manager.registry().is_empty());
}

#[test]
fn test_shutdown_joins_thread_cleanly() {
    let node = Node::start();
    assert!(node.manager.is_running());
    node.manager.shutdown().unwrap();
}
