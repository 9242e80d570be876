//! The routing manager: turns envelopes into socket writes.
//!
//! Application code never touches a socket. It wraps a message in a
//! [`NetMessage`] and pushes the envelope onto the bus; during the next
//! dispatch the router unwraps it and either re-publishes the child
//! locally or queues it on the right peer outboxes.
//!
//! ```text
//! push(NetMessage{Reliable(3), Chat}) ──dispatch──► Router ──► peer 3 outbox
//!                                                     │
//!                                    LocalOnly ◄──────┘ (back onto the bus)
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use netbus_bus::{BusError, MessageServer};
use netbus_protocol::{
    Address, Message, MessageFactory, NetMessage, NetProtocol, PassthroughFactory, PeerId,
    TypedMessage,
};
use netbus_session::PeerConnector;
use netbus_transport::{PeerRegistry, PeerState, SocketKind, SocketManager, TransportError};

use crate::{NetConfig, NetbusError};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`NetworkingManager`].
///
/// # Example
///
/// ```rust,no_run
/// use netbus::prelude::*;
///
/// # fn main() -> Result<(), NetbusError> {
/// let net = NetworkingManager::builder()
///     .config(NetConfig::default().bus_capacity(1024))
///     .build()?;
/// let bus = net.bus();
/// # Ok(())
/// # }
/// ```
pub struct NetworkingManagerBuilder {
    config: NetConfig,
    bus: Option<Arc<MessageServer>>,
    factory: Option<Arc<dyn MessageFactory>>,
}

impl NetworkingManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: NetConfig::default(),
            bus: None,
            factory: None,
        }
    }

    pub fn config(mut self, config: NetConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing bus instead of creating one from the config.
    pub fn bus(mut self, bus: Arc<MessageServer>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the factory that rebuilds messages from raw bytes, both for
    /// inbound frames and for envelope children. Defaults to
    /// [`PassthroughFactory`].
    pub fn factory(mut self, factory: Arc<dyn MessageFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Starts the socket thread and subscribes the router to envelopes.
    ///
    /// # Errors
    /// [`NetbusError::Transport`] if the socket thread can't start.
    pub fn build(self) -> Result<NetworkingManager, NetbusError> {
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(MessageServer::new(self.config.bus())));
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(PassthroughFactory));

        let sockets =
            SocketManager::start(self.config.sockets(), Arc::clone(&bus), Arc::clone(&factory))?;
        let fault = Arc::new(Mutex::new(None));

        let router = Router {
            registry: Arc::clone(sockets.registry()),
            factory,
            bus: Arc::downgrade(&bus),
            fault: Arc::clone(&fault),
        };
        bus.add_message_receiver(NetMessage::ID, move |message| router.route(message));

        tracing::info!(capacity = bus.capacity(), "networking manager started");
        Ok(NetworkingManager {
            bus,
            sockets,
            fault,
        })
    }
}

impl Default for NetworkingManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// NetworkingManager
// ---------------------------------------------------------------------------

/// Owns the socket thread and routes envelopes to peers.
///
/// Share it with `Arc<NetworkingManager>`; it implements [`PeerConnector`]
/// so [`Connection`](netbus_session::Connection)s can open peers through
/// it.
pub struct NetworkingManager {
    bus: Arc<MessageServer>,
    sockets: SocketManager,
    fault: Arc<Mutex<Option<BusError>>>,
}

impl NetworkingManager {
    pub fn builder() -> NetworkingManagerBuilder {
        NetworkingManagerBuilder::new()
    }

    pub fn bus(&self) -> &Arc<MessageServer> {
        &self.bus
    }

    /// Creates a peer for `address` and hands its sockets to the socket
    /// thread. A wildcard address listens instead of dialing.
    ///
    /// Returns [`PeerId::INVALID`] if a known peer already matches the
    /// address; no second peer is created.
    pub fn connect(&self, address: Address) -> PeerId {
        match self.sockets.registry().create_peer(address) {
            Some(sockets) => {
                let id = sockets.peer_id;
                tracing::info!(peer_id = %id, %address, "connecting");
                self.sockets.register_peer_sockets(sockets);
                id
            }
            None => {
                tracing::warn!(%address, "already connected to address");
                PeerId::INVALID
            }
        }
    }

    pub fn disconnect_peer(&self, id: PeerId) {
        self.sockets.disconnect_peer(id);
    }

    /// Disconnects every live peer. Pending connects fail right away.
    ///
    /// # Errors
    /// [`NetbusError::Transport`] if a failure message can't be published.
    pub fn disconnect_all(&self) -> Result<(), NetbusError> {
        self.sockets.disconnect_all()?;
        Ok(())
    }

    /// Known peers, pending ones and listeners included.
    pub fn peer_count(&self) -> usize {
        self.sockets.registry().len()
    }

    pub fn peer_state(&self, id: PeerId) -> Option<PeerState> {
        self.sockets.registry().state(id)
    }

    /// Records that `id` finished its handshake.
    pub fn mark_validated(&self, id: PeerId) -> bool {
        self.sockets.registry().set_state(id, PeerState::Valid)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        self.sockets.registry()
    }

    /// Wraps `message` in an envelope and pushes it.
    ///
    /// # Errors
    /// [`NetbusError::Bus`] if the bus is full.
    pub fn send(&self, protocol: NetProtocol, message: Message) -> Result<(), NetbusError> {
        let envelope = NetMessage::wrap(protocol, message);
        self.bus.push_message(envelope.into_message())?;
        Ok(())
    }

    /// Runs one bus dispatch and surfaces any fatal error seen since the
    /// last call.
    ///
    /// # Errors
    /// - [`NetbusError::Bus`] if the router couldn't re-publish a local
    ///   envelope
    /// - [`NetbusError::Transport`] if the socket thread has stopped
    pub fn dispatch_messages(&self) -> Result<usize, NetbusError> {
        let count = self.bus.dispatch_messages();
        if let Some(e) = lock(&self.fault).take() {
            return Err(e.into());
        }
        if !self.sockets.is_running() {
            tracing::error!("socket thread is gone");
            return Err(TransportError::Stopped.into());
        }
        Ok(count)
    }

    /// Stops the socket thread and reports how it ended.
    ///
    /// # Errors
    /// [`NetbusError::Transport`] if the thread had stopped on an error.
    pub fn shutdown(self) -> Result<(), NetbusError> {
        self.sockets.shutdown()?;
        Ok(())
    }
}

impl PeerConnector for NetworkingManager {
    fn connect(&self, address: Address) -> PeerId {
        NetworkingManager::connect(self, address)
    }

    fn disconnect_peer(&self, id: PeerId) {
        NetworkingManager::disconnect_peer(self, id);
    }

    fn mark_validated(&self, id: PeerId) {
        if !NetworkingManager::mark_validated(self, id) {
            tracing::debug!(peer_id = %id, "validated peer is already gone");
        }
    }
}

impl std::fmt::Debug for NetworkingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkingManager")
            .field("peers", &self.peer_count())
            .field("queued", &self.bus.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Router (runs inside dispatch)
// ---------------------------------------------------------------------------

struct Router {
    registry: Arc<PeerRegistry>,
    factory: Arc<dyn MessageFactory>,
    /// Weak: the bus owns this router through its receiver list.
    bus: Weak<MessageServer>,
    fault: Arc<Mutex<Option<BusError>>>,
}

impl Router {
    fn route(&self, message: &Message) {
        let envelope = match NetMessage::from_message(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "malformed envelope dropped");
                return;
            }
        };
        let protocol = envelope.protocol;
        let Some(child) = self.factory.create(envelope.child_id, envelope.payload) else {
            return;
        };

        match protocol {
            NetProtocol::LocalOnly => {
                let Some(bus) = self.bus.upgrade() else {
                    return;
                };
                if let Err(e) = bus.push_message(child) {
                    tracing::error!(error = %e, "local envelope lost");
                    lock(&self.fault).get_or_insert(e);
                }
            }
            NetProtocol::BroadcastUnreliable => {
                let count = self.registry.broadcast(SocketKind::Unreliable, &child);
                tracing::trace!(count, "unreliable broadcast queued");
            }
            NetProtocol::BroadcastReliable => {
                let count = self.registry.broadcast(SocketKind::Reliable, &child);
                tracing::trace!(count, "reliable broadcast queued");
            }
            NetProtocol::Unreliable(to) => self.unicast(to, SocketKind::Unreliable, child),
            NetProtocol::Reliable(to) => self.unicast(to, SocketKind::Reliable, child),
        }
    }

    fn unicast(&self, to: PeerId, kind: SocketKind, child: Message) {
        if !self.registry.send(to, kind, child) {
            tracing::debug!(peer_id = %to, ?kind, "no such peer, envelope dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use netbus_protocol::{MessageRegistry, message_id};
    use tokio::sync::Notify;

    use super::*;

    const CHAT: u32 = message_id("Chat");

    struct Fixture {
        bus: Arc<MessageServer>,
        registry: Arc<PeerRegistry>,
        fault: Arc<Mutex<Option<BusError>>>,
    }

    fn fixture(capacity: usize, factory: Arc<dyn MessageFactory>) -> Fixture {
        let bus = Arc::new(MessageServer::new(netbus_bus::BusConfig::with_capacity(capacity)));
        let registry = Arc::new(PeerRegistry::new(Arc::new(Notify::new())));
        let fault = Arc::new(Mutex::new(None));
        let router = Router {
            registry: Arc::clone(&registry),
            factory,
            bus: Arc::downgrade(&bus),
            fault: Arc::clone(&fault),
        };
        bus.add_message_receiver(NetMessage::ID, move |message| router.route(message));
        Fixture {
            bus,
            registry,
            fault,
        }
    }

    fn chat(text: &str) -> Message {
        let mut message = Message::new(CHAT);
        message.packet_mut().write_str(text);
        message
    }

    fn envelope(protocol: NetProtocol, child: Message) -> Message {
        NetMessage::wrap(protocol, child).into_message()
    }

    fn addr(port: u16) -> Address {
        Address::resolve("127.0.0.1", port).unwrap()
    }

    #[test]
    fn test_route_local_only_republishes_child() {
        let fx = fixture(16, Arc::new(PassthroughFactory));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fx.bus.add_message_receiver(CHAT, move |message| {
            sink.lock().unwrap().push(message.reader().read_string().unwrap());
        });

        fx.bus
            .push_message(envelope(NetProtocol::LocalOnly, chat("hi")))
            .unwrap();
        fx.bus.dispatch_messages();
        assert!(seen.lock().unwrap().is_empty(), "child arrives next dispatch");
        fx.bus.dispatch_messages();
        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_route_unicast_hits_only_destination() {
        let fx = fixture(16, Arc::new(PassthroughFactory));
        let a = fx.registry.create_peer(addr(7000)).unwrap();
        let b = fx.registry.create_peer(addr(8000)).unwrap();

        fx.bus
            .push_message(envelope(NetProtocol::Reliable(b.peer_id), chat("x")))
            .unwrap();
        fx.bus
            .push_message(envelope(NetProtocol::Unreliable(b.peer_id), chat("y")))
            .unwrap();
        fx.bus.dispatch_messages();

        assert_eq!(a.reliable.outbox().pending(), 0);
        assert_eq!(b.reliable.outbox().pending(), 1);
        assert_eq!(b.unreliable.outbox().pending(), 1);
    }

    #[test]
    fn test_route_broadcast_reaches_every_peer() {
        let fx = fixture(16, Arc::new(PassthroughFactory));
        let a = fx.registry.create_peer(addr(7000)).unwrap();
        let b = fx.registry.create_peer(addr(8000)).unwrap();

        fx.bus
            .push_message(envelope(NetProtocol::BroadcastReliable, chat("all")))
            .unwrap();
        fx.bus
            .push_message(envelope(NetProtocol::BroadcastUnreliable, chat("all")))
            .unwrap();
        fx.bus.dispatch_messages();

        for sockets in [&a, &b] {
            assert_eq!(sockets.reliable.outbox().pending(), 1);
            assert_eq!(sockets.unreliable.outbox().pending(), 1);
        }
    }

    #[test]
    fn test_route_unknown_child_dropped_by_factory() {
        let fx = fixture(16, Arc::new(MessageRegistry::with_lifecycle()));
        let a = fx.registry.create_peer(addr(7000)).unwrap();

        fx.bus
            .push_message(envelope(NetProtocol::Reliable(a.peer_id), chat("?")))
            .unwrap();
        fx.bus.dispatch_messages();
        assert_eq!(a.reliable.outbox().pending(), 0);
    }

    #[test]
    fn test_route_unknown_destination_is_dropped() {
        let fx = fixture(16, Arc::new(PassthroughFactory));
        fx.bus
            .push_message(envelope(NetProtocol::Reliable(PeerId(9)), chat("lost")))
            .unwrap();
        assert_eq!(fx.bus.dispatch_messages(), 1);
        assert!(lock(&fx.fault).is_none());
    }

    #[test]
    fn test_route_local_only_on_full_bus_records_fault() {
        let bus = Arc::new(MessageServer::new(netbus_bus::BusConfig::with_capacity(1)));
        // Registered before the router, so the slot is taken when it runs.
        let filler = Arc::downgrade(&bus);
        bus.add_message_receiver(NetMessage::ID, move |_| {
            if let Some(bus) = filler.upgrade() {
                bus.push_message(Message::new(1)).unwrap();
            }
        });
        let fault = Arc::new(Mutex::new(None));
        let router = Router {
            registry: Arc::new(PeerRegistry::new(Arc::new(Notify::new()))),
            factory: Arc::new(PassthroughFactory),
            bus: Arc::downgrade(&bus),
            fault: Arc::clone(&fault),
        };
        bus.add_message_receiver(NetMessage::ID, move |message| router.route(message));

        bus.push_message(envelope(NetProtocol::LocalOnly, chat("x")))
            .unwrap();
        bus.dispatch_messages();

        assert_eq!(
            lock(&fault).take(),
            Some(BusError::Overflow { capacity: 1 })
        );
    }
}
