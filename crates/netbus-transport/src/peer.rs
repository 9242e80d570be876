//! Peers and the registry that tracks them.
//!
//! A [`Peer`] is one remote identity: a reliable and an unreliable socket
//! that share a host and sit on adjacent ports. The [`PeerRegistry`] holds
//! every known peer behind a lock, because both the application thread
//! (connecting, routing envelopes) and the multiplexer thread (accepting
//! clients, dropping dead sockets) change it.
//!
//! ```text
//! connect(addr) ──→ Peer::initialize() ──→ PeerSockets ──→ multiplexer
//!                        │
//!                        └── outboxes stay with the Peer, so routing can
//!                            queue messages from any thread
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use netbus_protocol::{Address, Message, PeerId};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;

use crate::frame::encode_frame;
use crate::{Outbox, Socket, SocketKind};

/// Connection state of a peer as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerState {
    /// Sockets exist but aren't connected yet.
    #[default]
    NoConnection,
    /// Sockets are live; the handshake hasn't finished.
    Unvalidated,
    /// The handshake accepted this peer.
    Valid,
}

/// Both sockets of one peer, in transit to the multiplexer.
#[derive(Debug)]
pub struct PeerSockets {
    pub peer_id: PeerId,
    pub reliable: Socket,
    pub unreliable: Socket,
}

impl PeerSockets {
    pub fn close(&mut self) {
        self.reliable.close();
        self.unreliable.close();
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// One remote identity.
///
/// Two peers are equal when either socket address matches. That is the
/// only de-duplication key the router uses.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    address: Address,
    unreliable_address: Address,
    state: PeerState,
    reliable: Outbox,
    unreliable: Outbox,
    initialized: bool,
}

impl Peer {
    /// A peer whose unreliable half lives at `address` port + 1. An address
    /// on the last port gets no unreliable half ([`Address::none`]).
    pub fn new(id: PeerId, address: Address, waker: Arc<Notify>) -> Self {
        Self {
            id,
            address,
            unreliable_address: address.with_port_offset(1).unwrap_or_else(Address::none),
            state: PeerState::NoConnection,
            reliable: Outbox::new(Arc::clone(&waker)),
            unreliable: Outbox::new(waker),
            initialized: false,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn unreliable_address(&self) -> Address {
        self.unreliable_address
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }

    /// `true` for a peer bound to a wildcard address. It accepts clients
    /// and has no remote to send to.
    pub fn is_listening(&self) -> bool {
        self.address.is_any()
    }

    /// Builds both sockets the first time; later calls return `None`.
    pub fn initialize(&mut self) -> Option<PeerSockets> {
        if self.initialized {
            return None;
        }
        self.initialized = true;
        Some(PeerSockets {
            peer_id: self.id,
            reliable: Socket::new(
                SocketKind::Reliable,
                self.address,
                self.id,
                self.reliable.clone(),
            ),
            unreliable: Socket::new(
                SocketKind::Unreliable,
                self.unreliable_address,
                self.id,
                self.unreliable.clone(),
            ),
        })
    }

    /// Wraps a client accepted by a listener. The reliable socket is the
    /// accepted stream; the unreliable one sends through the listener's
    /// datagram socket.
    fn initialize_accepted(
        &mut self,
        stream: TcpStream,
        datagrams: Arc<UdpSocket>,
    ) -> PeerSockets {
        self.initialized = true;
        PeerSockets {
            peer_id: self.id,
            reliable: Socket::accepted(
                stream,
                self.address.socket_addr(),
                self.id,
                self.reliable.clone(),
            ),
            unreliable: Socket::shared_datagram(
                datagrams,
                self.unreliable_address,
                self.id,
                self.unreliable.clone(),
            ),
        }
    }

    pub fn send_reliable_message(&self, message: Message) {
        self.reliable.store_message(message);
    }

    pub fn send_unreliable_message(&self, message: Message) {
        self.unreliable.store_message(message);
    }

    fn outbox(&self, kind: SocketKind) -> &Outbox {
        match kind {
            SocketKind::Reliable => &self.reliable,
            SocketKind::Unreliable => &self.unreliable,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address || self.unreliable_address == other.unreliable_address
    }
}

// ---------------------------------------------------------------------------
// PeerRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryInner {
    peers: Vec<Peer>,
    next_id: i32,
}

/// Every known peer, shared by the router and the multiplexer.
///
/// Ids come from a counter and are never reused.
#[derive(Debug)]
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
    waker: Arc<Notify>,
}

impl PeerRegistry {
    /// `waker` is signalled whenever a peer's outbox receives a frame.
    pub fn new(waker: Arc<Notify>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            waker,
        }
    }

    /// Registers a peer for `address` and returns its sockets.
    ///
    /// Returns `None` without registering anything when a known peer
    /// already matches the address.
    pub fn create_peer(&self, address: Address) -> Option<PeerSockets> {
        let mut inner = self.lock();
        let id = PeerId(inner.next_id);
        let mut candidate = Peer::new(id, address, Arc::clone(&self.waker));
        if inner.peers.iter().any(|peer| *peer == candidate) {
            tracing::debug!(%address, "peer already known");
            return None;
        }
        inner.next_id += 1;
        let sockets = candidate.initialize();
        inner.peers.push(candidate);
        tracing::debug!(peer_id = %id, %address, "peer registered");
        sockets
    }

    /// Registers a client accepted by a listener as a new peer, already in
    /// the [`PeerState::Unvalidated`] state.
    pub(crate) fn create_accepted(
        &self,
        address: Address,
        stream: TcpStream,
        datagrams: Arc<UdpSocket>,
    ) -> PeerSockets {
        let mut inner = self.lock();
        let id = PeerId(inner.next_id);
        inner.next_id += 1;
        let mut peer = Peer::new(id, address, Arc::clone(&self.waker));
        peer.set_state(PeerState::Unvalidated);
        let sockets = peer.initialize_accepted(stream, datagrams);
        inner.peers.push(peer);
        sockets
    }

    /// Forgets a peer. Returns `false` if it wasn't registered.
    pub fn remove(&self, id: PeerId) -> bool {
        let mut inner = self.lock();
        let before = inner.peers.len();
        inner.peers.retain(|peer| peer.id != id);
        before != inner.peers.len()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.lock().peers.iter().any(|peer| peer.id == id)
    }

    pub fn state(&self, id: PeerId) -> Option<PeerState> {
        self.with_peer(id, Peer::state)
    }

    pub fn address(&self, id: PeerId) -> Option<Address> {
        self.with_peer(id, Peer::address)
    }

    /// Returns `false` if the peer isn't registered.
    pub fn set_state(&self, id: PeerId, state: PeerState) -> bool {
        let mut inner = self.lock();
        match inner.peers.iter_mut().find(|peer| peer.id == id) {
            Some(peer) => {
                peer.set_state(state);
                true
            }
            None => false,
        }
    }

    /// The peer whose unreliable half lives at `address`.
    pub fn find_by_unreliable_address(&self, address: Address) -> Option<PeerId> {
        self.lock()
            .peers
            .iter()
            .find(|peer| peer.unreliable_address == address)
            .map(Peer::id)
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.lock().peers.iter().map(Peer::id).collect()
    }

    /// Queues `message` on one peer. Returns `false` if the peer is unknown
    /// or is a listener.
    pub fn send(&self, id: PeerId, kind: SocketKind, message: Message) -> bool {
        let inner = self.lock();
        match inner.peers.iter().find(|peer| peer.id == id) {
            Some(peer) if !peer.is_listening() => {
                peer.outbox(kind).store_message(message);
                true
            }
            Some(_) => {
                tracing::warn!(peer_id = %id, "cannot send to a listening peer");
                false
            }
            None => false,
        }
    }

    /// Queues `message` on every peer except listeners. The frame is encoded
    /// once. Returns how many peers it was queued on.
    pub fn broadcast(&self, kind: SocketKind, message: &Message) -> usize {
        let frame = encode_frame(&message.to_wire());
        let inner = self.lock();
        let mut count = 0;
        for peer in inner.peers.iter().filter(|peer| !peer.is_listening()) {
            peer.outbox(kind).store_frame(frame.clone());
            count += 1;
        }
        count
    }

    fn with_peer<T>(&self, id: PeerId, f: impl FnOnce(&Peer) -> T) -> Option<T> {
        self.lock().peers.iter().find(|peer| peer.id == id).map(f)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
