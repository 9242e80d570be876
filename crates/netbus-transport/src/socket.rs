//! A single non-blocking network endpoint with message framing.
//!
//! A [`Socket`] is created idle by its [`Peer`](crate::Peer), handed to the
//! multiplexer thread, and connected there. From then on only the
//! multiplexer touches the OS handle. Other threads reach the socket
//! through its [`Outbox`], a locked frame queue that also wakes the
//! multiplexer.
//!
//! The reliable half is TCP: either a connected stream or, for wildcard
//! addresses, a listener. The unreliable half is UDP and comes in three
//! roles (see [`DatagramRole`]).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use netbus_protocol::{Address, Message, PeerId};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;

use crate::Status;
use crate::frame::{self, FrameAssembler, OutboundQueue};

/// Which transport a socket uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// TCP. Ordered and guaranteed.
    Reliable,
    /// UDP. One frame per datagram, no guarantees.
    Unreliable,
}

/// How a UDP socket relates to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramRole {
    /// Bound next to a listener. Receives for every accepted client and
    /// sends nothing itself.
    Listener,
    /// Bound next to an outbound TCP connection. Sends to and receives from
    /// one remote.
    Outbound,
    /// Borrows a listener's socket to send to one accepted client. Never
    /// reads, so it can't steal the listener's datagrams.
    Accepted,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// The thread-safe sending side of a socket.
///
/// Cloning an outbox shares the same queue.
#[derive(Clone)]
pub struct Outbox {
    queue: Arc<Mutex<OutboundQueue>>,
    waker: Arc<Notify>,
}

impl Outbox {
    pub fn new(waker: Arc<Notify>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(OutboundQueue::new())),
            waker,
        }
    }

    /// Encodes `message` as a frame and queues it. Wakes the multiplexer.
    pub fn store_message(&self, message: Message) {
        self.store_frame(frame::encode_frame(&message.to_wire()));
    }

    /// Queues an already encoded frame. Broadcasts encode once and store
    /// the same bytes on every peer.
    pub fn store_frame(&self, frame: Vec<u8>) {
        self.lock().push(frame);
        self.waker.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, OutboundQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").field("pending", &self.pending()).finish()
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// One complete inbound frame and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

/// What woke a socket during the readiness poll.
#[derive(Debug)]
pub(crate) enum Readiness {
    Io,
    Error,
    Accepted(TcpStream, SocketAddr),
}

enum Handle {
    Idle,
    Stream {
        stream: TcpStream,
        remote: SocketAddr,
        assembler: FrameAssembler,
    },
    Listener(TcpListener),
    Datagram {
        socket: Arc<UdpSocket>,
        target: Option<SocketAddr>,
        role: DatagramRole,
    },
    Closed,
}

/// A non-blocking endpoint owned by the multiplexer.
pub struct Socket {
    kind: SocketKind,
    address: Address,
    peer_id: PeerId,
    outbox: Outbox,
    handle: Handle,
}

impl Socket {
    /// An unconnected socket for `address`. The unreliable half of a peer
    /// is created with the already offset (`port + 1`) address.
    pub fn new(kind: SocketKind, address: Address, peer_id: PeerId, outbox: Outbox) -> Self {
        Self {
            kind,
            address,
            peer_id,
            outbox,
            handle: Handle::Idle,
        }
    }

    /// Wraps a stream returned by a listener's `accept`.
    pub(crate) fn accepted(
        stream: TcpStream,
        remote: SocketAddr,
        peer_id: PeerId,
        outbox: Outbox,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer_id, error = %e, "could not disable Nagle on accepted stream");
        }
        Self {
            kind: SocketKind::Reliable,
            address: Address::from_socket_addr(remote),
            peer_id,
            outbox,
            handle: Handle::Stream {
                stream,
                remote,
                assembler: FrameAssembler::new(),
            },
        }
    }

    /// Sends through a listener's datagram socket to one accepted client.
    pub(crate) fn shared_datagram(
        socket: Arc<UdpSocket>,
        target: Address,
        peer_id: PeerId,
        outbox: Outbox,
    ) -> Self {
        let target_addr = (!target.is_none()).then(|| target.socket_addr());
        Self {
            kind: SocketKind::Unreliable,
            address: target,
            peer_id,
            outbox,
            handle: Handle::Datagram {
                socket,
                target: target_addr,
                role: DatagramRole::Accepted,
            },
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.handle, Handle::Idle | Handle::Closed)
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.handle, Handle::Listener(_))
    }

    pub fn datagram_role(&self) -> Option<DatagramRole> {
        match &self.handle {
            Handle::Datagram { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// The listener's datagram socket, for sharing with accepted clients.
    pub(crate) fn listener_datagrams(&self) -> Option<Arc<UdpSocket>> {
        match &self.handle {
            Handle::Datagram {
                socket,
                role: DatagramRole::Listener,
                ..
            } => Some(Arc::clone(socket)),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.handle {
            Handle::Stream { stream, .. } => stream.local_addr().ok(),
            Handle::Listener(listener) => listener.local_addr().ok(),
            Handle::Datagram { socket, .. } => socket.local_addr().ok(),
            Handle::Idle | Handle::Closed => None,
        }
    }

    /// Thread-safe enqueue; see [`Outbox::store_message`].
    pub fn store_message(&self, message: Message) {
        self.outbox.store_message(message);
    }

    // -- Connect ----------------------------------------------------------

    /// Opens the OS handle.
    ///
    /// Reliable sockets listen on wildcard addresses and otherwise connect,
    /// bounded by `timeout`. Unreliable sockets bind next to their reliable
    /// partner: on the listen port + 1 for a listener, or on
    /// `local_hint.port() + 1` (the local TCP port + 1) when dialing out.
    /// The none and broadcast addresses are rejected with `Error`.
    pub async fn connect(&mut self, timeout: Duration, local_hint: Option<SocketAddr>) -> Status {
        if self.address.is_none() || self.address.is_broadcast() {
            tracing::warn!(peer_id = %self.peer_id, address = %self.address, "refusing to connect to a none or broadcast address");
            return Status::Error;
        }
        if self.is_connected() {
            return Status::Done;
        }
        match self.kind {
            SocketKind::Reliable => self.connect_reliable(timeout).await,
            SocketKind::Unreliable => self.connect_unreliable(local_hint).await,
        }
    }

    async fn connect_reliable(&mut self, timeout: Duration) -> Status {
        let addr = self.address.socket_addr();
        if self.address.is_any() {
            return match TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::info!(peer_id = %self.peer_id, %addr, "listening");
                    self.handle = Handle::Listener(listener);
                    Status::Done
                }
                Err(e) => {
                    tracing::warn!(peer_id = %self.peer_id, %addr, error = %e, "listen failed");
                    Status::Error
                }
            };
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(peer_id = %self.peer_id, %addr, error = %e, "connect failed");
                return Status::Error;
            }
            Err(_) => {
                tracing::debug!(peer_id = %self.peer_id, %addr, ?timeout, "connect timed out");
                return Status::Error;
            }
        };

        // A stream without a remote identity was refused after the fact.
        let remote = match stream.peer_addr() {
            Ok(remote) => remote,
            Err(e) => {
                tracing::debug!(peer_id = %self.peer_id, %addr, error = %e, "connection refused");
                return Status::Error;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_id = %self.peer_id, error = %e, "could not disable Nagle");
        }
        self.handle = Handle::Stream {
            stream,
            remote,
            assembler: FrameAssembler::new(),
        };
        Status::Done
    }

    async fn connect_unreliable(&mut self, local_hint: Option<SocketAddr>) -> Status {
        let (bind, target, role) = if self.address.is_any() {
            (self.address.socket_addr(), None, DatagramRole::Listener)
        } else {
            let port = local_hint
                .and_then(|hint| hint.port().checked_add(1))
                .unwrap_or(0);
            let bind = SocketAddr::new(unspecified_like(self.address.ip()), port);
            (bind, Some(self.address.socket_addr()), DatagramRole::Outbound)
        };

        match UdpSocket::bind(bind).await {
            Ok(socket) => {
                tracing::debug!(peer_id = %self.peer_id, %bind, ?role, "datagram socket bound");
                self.handle = Handle::Datagram {
                    socket: Arc::new(socket),
                    target,
                    role,
                };
                Status::Done
            }
            Err(e) => {
                tracing::warn!(peer_id = %self.peer_id, %bind, error = %e, "datagram bind failed");
                Status::Error
            }
        }
    }

    // -- Send / receive ---------------------------------------------------

    /// Flushes the outbox. See [`OutboundQueue::flush_stream`] and
    /// [`OutboundQueue::flush_datagrams`].
    pub fn send_outgoing_messages(&mut self) -> Status {
        let outbox = self.outbox.clone();
        let mut queue = outbox.lock();
        if queue.is_empty() {
            return Status::Done;
        }
        match &mut self.handle {
            Handle::Stream { stream, .. } => queue.flush_stream(stream),
            Handle::Datagram {
                socket,
                target: Some(target),
                ..
            } => queue.flush_datagrams(&**socket, *target),
            Handle::Datagram { target: None, .. } | Handle::Listener(_) => {
                tracing::debug!(
                    peer_id = %self.peer_id,
                    dropped = queue.len(),
                    "socket has no remote; dropping outgoing frames"
                );
                queue.clear();
                Status::Done
            }
            Handle::Idle => Status::NotReady,
            Handle::Closed => {
                queue.clear();
                Status::Error
            }
        }
    }

    /// Reads at most one frame.
    ///
    /// Streams go through the [`FrameAssembler`]; datagram sockets read one
    /// datagram. Listeners and sockets that never read report `NotReady`.
    pub fn receive_incoming_message(&mut self) -> (Status, Option<Frame>) {
        match &mut self.handle {
            Handle::Stream {
                stream,
                remote,
                assembler,
            } => {
                let (status, payload) = assembler.receive(stream);
                let frame = payload.map(|payload| Frame {
                    payload,
                    from: *remote,
                });
                (status, frame)
            }
            Handle::Datagram { socket, role, .. } if *role != DatagramRole::Accepted => {
                let (status, received) = frame::receive_datagram(&**socket);
                (status, received.map(|(payload, from)| Frame { payload, from }))
            }
            Handle::Closed => (Status::Error, None),
            _ => (Status::NotReady, None),
        }
    }

    /// Takes one pending client off a listener without waiting.
    pub(crate) fn try_accept(&mut self) -> Option<(TcpStream, SocketAddr)> {
        let Handle::Listener(listener) = &self.handle else {
            return None;
        };
        match listener.accept().now_or_never()? {
            Ok(accepted) => Some(accepted),
            Err(e) => {
                tracing::warn!(peer_id = %self.peer_id, error = %e, "accept failed");
                None
            }
        }
    }

    /// Waits until the socket has something to do.
    ///
    /// Read interest is always registered; write interest only while the
    /// outbox has frames. A listener resolves with the accepted client,
    /// which the caller must take over. Sockets with nothing to wait for
    /// never resolve.
    pub(crate) async fn readiness(&self) -> Readiness {
        let interest = if self.outbox.has_pending() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = match &self.handle {
            Handle::Stream { stream, .. } => stream.ready(interest).await,
            Handle::Listener(listener) => {
                return match listener.accept().await {
                    Ok((stream, from)) => Readiness::Accepted(stream, from),
                    Err(e) => {
                        tracing::warn!(peer_id = %self.peer_id, error = %e, "accept failed");
                        Readiness::Io
                    }
                };
            }
            Handle::Datagram { socket, role, .. } => match role {
                DatagramRole::Accepted if !self.outbox.has_pending() => {
                    return std::future::pending().await;
                }
                DatagramRole::Accepted => socket.ready(Interest::WRITABLE).await,
                _ => socket.ready(interest).await,
            },
            Handle::Idle | Handle::Closed => return std::future::pending().await,
        };
        match ready {
            Ok(ready) if ready.is_error() => Readiness::Error,
            Ok(_) => Readiness::Io,
            Err(_) => Readiness::Error,
        }
    }

    /// Drops the OS handle and any unsent frames.
    pub fn close(&mut self) {
        self.handle = Handle::Closed;
        self.outbox.lock().clear();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("peer_id", &self.peer_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
