//! The I/O multiplexer: one dedicated thread that owns every live socket.
//!
//! The thread (named `netbus-sockets`) drives a single-threaded tokio
//! runtime. Other threads never touch a socket directly; they talk to the
//! loop through three channels:
//!
//! - the pending lists (new peers to connect, peers to disconnect),
//! - each peer's [`Outbox`](crate::Outbox),
//! - a [`Notify`] that wakes the loop when either of those changes.
//!
//! One iteration of the loop:
//!
//! ```text
//! swap pending ──→ connect new peers ──→ disconnect peers
//!      ▲                                        │
//!      │                                        ▼
//!  service sockets ◀── wait (readiness | wake | poll_timeout)
//! ```
//!
//! Lifecycle events ([`ConnectedMessage`], [`DisconnectedMessage`],
//! [`ConnectionFailedMessage`]) and every complete inbound frame are
//! pushed onto the [`MessageServer`]. A full bus stops the loop.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::future::select_all;
use netbus_bus::MessageServer;
use netbus_protocol::{
    Address, ConnectOrigin, ConnectedMessage, ConnectionFailedMessage, DisconnectedMessage,
    Message, MessageFactory, PeerId, TypedMessage,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::socket::Readiness;
use crate::{DatagramRole, PeerRegistry, PeerSockets, PeerState, Socket, Status, TransportError};

// ---------------------------------------------------------------------------
// SocketManagerConfig
// ---------------------------------------------------------------------------

/// Tuning for the multiplexer thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketManagerConfig {
    /// Upper bound on one outbound TCP connect.
    pub connect_timeout: Duration,

    /// Longest the loop sleeps when nothing happens.
    pub poll_timeout: Duration,

    /// Frames read from one socket per iteration, so a chatty peer can't
    /// starve the others.
    pub max_frames_per_poll: usize,
}

impl Default for SocketManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(50),
            max_frames_per_poll: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    connects: Vec<PeerSockets>,
    disconnects: Vec<PeerId>,
    disconnect_all: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    registry: Arc<PeerRegistry>,
    waker: Arc<Notify>,
    bus: Arc<MessageServer>,
    shutdown: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, message: Message) -> Result<(), TransportError> {
        self.bus.push_message(message).map_err(TransportError::from)
    }
}

// ---------------------------------------------------------------------------
// SocketManager
// ---------------------------------------------------------------------------

/// Handle to the multiplexer thread.
///
/// ## Threads
///
/// `start` spawns one thread named `netbus-sockets` running a
/// single-threaded tokio runtime. Every socket lives on that thread. The
/// handle's methods never touch a socket: they append to a pending list
/// and wake the thread, which picks the request up on its next pass.
/// Peer ids come from the shared [`PeerRegistry`] before a dial is queued,
/// so callers know the id a later `Connected` or `ConnectionFailed` will
/// carry.
///
/// ## What comes out
///
/// Everything the thread learns is published on the bus as a message:
/// `Connected` when a dial, bind or accept completes, `ConnectionFailed`
/// when a dial does not, `Disconnected` when a peer goes away, and each
/// received frame as its own message stamped with the peer that sent it.
/// Nothing is delivered until the bus is dispatched.
///
/// ## Stopping
///
/// Dropping the handle stops the thread and waits for it. Use
/// [`shutdown`](Self::shutdown) to see how the thread ended. A full bus
/// also stops the thread, since messages after that point would be lost.
pub struct SocketManager {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Result<(), TransportError>>>,
}

impl SocketManager {
    /// Builds the runtime and starts the `netbus-sockets` thread.
    ///
    /// # Errors
    /// [`TransportError::Runtime`] or [`TransportError::Spawn`] when the OS
    /// refuses.
    pub fn start(
        config: SocketManagerConfig,
        bus: Arc<MessageServer>,
        factory: Arc<dyn MessageFactory>,
    ) -> Result<Self, TransportError> {
        let waker = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            registry: Arc::new(PeerRegistry::new(Arc::clone(&waker))),
            waker,
            bus,
            shutdown: AtomicBool::new(false),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;

        let io_loop = IoLoop {
            shared: Arc::clone(&shared),
            config,
            factory,
            live: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name("netbus-sockets".into())
            .spawn(move || {
                let result = runtime.block_on(io_loop.run());
                if let Err(e) = &result {
                    tracing::error!(error = %e, "socket thread stopped");
                }
                result
            })
            .map_err(TransportError::Spawn)?;

        tracing::info!("socket thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// The peer registry this manager keeps up to date.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.shared.registry
    }

    /// Queues a peer's sockets for connecting on the next iteration.
    pub fn register_peer_sockets(&self, sockets: PeerSockets) {
        tracing::debug!(peer_id = %sockets.peer_id, "peer queued for connect");
        self.shared.pending().connects.push(sockets);
        self.shared.waker.notify_one();
    }

    /// Queues a live peer for disconnection.
    pub fn disconnect_peer(&self, id: PeerId) {
        self.shared.pending().disconnects.push(id);
        self.shared.waker.notify_one();
    }

    /// Disconnects every live peer on the next iteration. Peers still
    /// waiting to connect fail right away, on the calling thread.
    ///
    /// # Errors
    /// [`TransportError::BusOverflow`] if a failure message can't be
    /// published.
    pub fn disconnect_all(&self) -> Result<(), TransportError> {
        let cancelled = {
            let mut pending = self.shared.pending();
            pending.disconnect_all = true;
            std::mem::take(&mut pending.connects)
        };
        self.shared.waker.notify_one();

        for mut sockets in cancelled {
            sockets.close();
            self.shared.registry.remove(sockets.peer_id);
            tracing::debug!(peer_id = %sockets.peer_id, "pending connect cancelled");
            self.shared.publish(
                ConnectionFailedMessage {
                    peer_id: sockets.peer_id,
                }
                .into_message(),
            )?;
        }
        Ok(())
    }

    /// `false` once the thread has exited, for whatever reason.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the thread and reports how it ended.
    ///
    /// # Errors
    /// [`TransportError::BusOverflow`] if the loop had stopped on a full
    /// bus, [`TransportError::Panicked`] if it panicked.
    pub fn shutdown(mut self) -> Result<(), TransportError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.waker.notify_one();
        let result = thread.join().map_err(|_| TransportError::Panicked)?;
        tracing::info!("socket thread stopped");
        result
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "socket thread ended with an error");
        }
    }
}

// ---------------------------------------------------------------------------
// IoLoop (runs on the socket thread)
// ---------------------------------------------------------------------------

struct IoLoop {
    shared: Arc<Shared>,
    config: SocketManagerConfig,
    factory: Arc<dyn MessageFactory>,
    live: Vec<PeerSockets>,
}

/// What ended one wait.
enum Wake {
    Idle,
    Socket(PeerId, Readiness),
}

type ReadinessFuture<'a> = Pin<Box<dyn Future<Output = (PeerId, Readiness)> + 'a>>;

impl IoLoop {
    async fn run(mut self) -> Result<(), TransportError> {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            let (connects, mut disconnects, disconnect_all) = {
                let mut pending = self.shared.pending();
                (
                    std::mem::take(&mut pending.connects),
                    std::mem::take(&mut pending.disconnects),
                    std::mem::take(&mut pending.disconnect_all),
                )
            };

            for sockets in connects {
                self.open(sockets).await?;
            }

            if disconnect_all {
                disconnects = self.live.iter().map(|peer| peer.peer_id).collect();
            }
            for id in disconnects {
                self.drop_peer(id)?;
            }

            let wake = self.wait().await;
            self.service(wake)?;
        }

        for peer in &mut self.live {
            peer.close();
        }
        Ok(())
    }

    /// Connects both halves of a new peer and publishes the outcome.
    async fn open(&mut self, mut sockets: PeerSockets) -> Result<(), TransportError> {
        let id = sockets.peer_id;
        let address = sockets.reliable.address();
        let timeout = self.config.connect_timeout;

        let mut status = sockets.reliable.connect(timeout, None).await;
        if status == Status::Done {
            let hint = sockets.reliable.local_addr();
            status = sockets.unreliable.connect(timeout, hint).await;
        }

        if status != Status::Done {
            sockets.close();
            self.shared.registry.remove(id);
            tracing::info!(peer_id = %id, %address, ?status, "connection failed");
            return self
                .shared
                .publish(ConnectionFailedMessage { peer_id: id }.into_message());
        }

        let origin = if sockets.reliable.is_listener() {
            ConnectOrigin::Listening
        } else {
            ConnectOrigin::Outbound
        };
        self.shared.registry.set_state(id, PeerState::Unvalidated);
        self.live.push(sockets);
        tracing::info!(peer_id = %id, %address, ?origin, "peer connected");
        self.shared.publish(
            ConnectedMessage {
                peer_id: id,
                address,
                origin,
            }
            .into_message(),
        )
    }

    /// Closes a live peer, forgets it, and publishes `Disconnected`.
    fn drop_peer(&mut self, id: PeerId) -> Result<(), TransportError> {
        let Some(index) = self.live.iter().position(|peer| peer.peer_id == id) else {
            tracing::debug!(peer_id = %id, "disconnect for unknown peer ignored");
            return Ok(());
        };
        let mut sockets = self.live.swap_remove(index);
        sockets.close();
        self.shared.registry.remove(id);
        tracing::info!(peer_id = %id, "peer disconnected");
        self.shared
            .publish(DisconnectedMessage { peer_id: id }.into_message())
    }

    /// Sleeps until a socket is ready, another thread wakes us, or the poll
    /// timeout passes.
    async fn wait(&self) -> Wake {
        let notified = self.shared.waker.notified();
        let sleep = tokio::time::sleep(self.config.poll_timeout);

        let mut futures: Vec<ReadinessFuture<'_>> = Vec::with_capacity(self.live.len() * 2);
        for peer in &self.live {
            for socket in [&peer.reliable, &peer.unreliable] {
                let id = peer.peer_id;
                futures.push(Box::pin(async move { (id, socket.readiness().await) }));
            }
        }

        if futures.is_empty() {
            tokio::select! {
                _ = notified => {}
                _ = sleep => {}
            }
            return Wake::Idle;
        }

        tokio::select! {
            ((id, readiness), _, _) = select_all(futures) => Wake::Socket(id, readiness),
            _ = notified => Wake::Idle,
            _ = sleep => Wake::Idle,
        }
    }

    /// Accepts, reads and flushes every live socket without blocking.
    fn service(&mut self, wake: Wake) -> Result<(), TransportError> {
        let mut failed = Vec::new();
        let mut accepted = Vec::new();

        match wake {
            Wake::Socket(listener, Readiness::Accepted(stream, from)) => {
                accepted.push((listener, stream, from));
            }
            Wake::Socket(id, Readiness::Error) => failed.push(id),
            Wake::Socket(_, Readiness::Io) | Wake::Idle => {}
        }

        let max_frames = self.config.max_frames_per_poll.max(1);
        let mut inbound = Vec::new();

        for peer in &mut self.live {
            let id = peer.peer_id;
            if failed.contains(&id) {
                continue;
            }

            while let Some((stream, from)) = peer.reliable.try_accept() {
                accepted.push((id, stream, from));
            }

            for socket in [&mut peer.reliable, &mut peer.unreliable] {
                match drain(socket, max_frames, &mut inbound) {
                    Status::Disconnected | Status::Error => {
                        failed.push(id);
                        break;
                    }
                    _ => {}
                }
                if socket.send_outgoing_messages().is_terminal() {
                    failed.push(id);
                    break;
                }
            }
        }

        for (source, payload) in inbound {
            let origin = match source {
                Source::Peer(id) => id,
                Source::Datagram(from) => {
                    let sender = Address::from_socket_addr(from);
                    match self.shared.registry.find_by_unreliable_address(sender) {
                        Some(id) => id,
                        None => {
                            tracing::debug!(%from, "datagram from unknown sender dropped");
                            continue;
                        }
                    }
                }
            };
            self.deliver(origin, payload)?;
        }
        for (listener, stream, from) in accepted {
            self.accept_client(listener, stream, from)?;
        }
        failed.dedup();
        for id in failed {
            self.drop_peer(id)?;
        }
        Ok(())
    }

    /// Turns a client accepted by `listener` into a new live peer.
    fn accept_client(
        &mut self,
        listener: PeerId,
        stream: TcpStream,
        from: SocketAddr,
    ) -> Result<(), TransportError> {
        let datagrams = self
            .live
            .iter()
            .find(|peer| peer.peer_id == listener)
            .and_then(|peer| peer.unreliable.listener_datagrams());
        let Some(datagrams) = datagrams else {
            tracing::warn!(listener = %listener, %from, "listener gone; dropping accepted client");
            return Ok(());
        };

        let address = Address::from_socket_addr(from);
        let sockets = self
            .shared
            .registry
            .create_accepted(address, stream, datagrams);
        let id = sockets.peer_id;
        self.live.push(sockets);
        tracing::info!(peer_id = %id, listener = %listener, %address, "client accepted");
        self.shared.publish(
            ConnectedMessage {
                peer_id: id,
                address,
                origin: ConnectOrigin::Accepted { listener },
            }
            .into_message(),
        )
    }

    /// Rebuilds an inbound payload through the factory and publishes it.
    fn deliver(&self, origin: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        let wire = match Message::from_wire(&payload) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!(peer_id = %origin, error = %e, "dropping undecodable frame");
                return Ok(());
            }
        };
        let id = wire.id();
        let Some(mut message) = self.factory.create(id, wire.into_packet().into_bytes()) else {
            tracing::debug!(peer_id = %origin, id, "factory refused inbound message");
            return Ok(());
        };
        message.set_origin(origin);
        self.shared.publish(message)
    }
}

/// Who an inbound frame belongs to.
enum Source {
    Peer(PeerId),
    /// Arrived on a listener's datagram socket; resolved by sender address.
    Datagram(SocketAddr),
}

/// Reads up to `max_frames` frames from one socket into `inbound` and
/// returns the last status seen.
fn drain(socket: &mut Socket, max_frames: usize, inbound: &mut Vec<(Source, Vec<u8>)>) -> Status {
    let role = socket.datagram_role();
    let mut status = Status::NotReady;
    for _ in 0..max_frames {
        let (next, frame) = socket.receive_incoming_message();
        status = next;
        let Some(frame) = frame else {
            if status == Status::Done {
                continue;
            }
            break;
        };
        match role {
            Some(DatagramRole::Listener) => inbound.push((Source::Datagram(frame.from), frame.payload)),
            Some(DatagramRole::Outbound)
                if Address::from_socket_addr(frame.from) != socket.address() =>
            {
                tracing::debug!(from = %frame.from, "datagram from unexpected sender dropped");
            }
            _ => inbound.push((Source::Peer(socket.peer_id()), frame.payload)),
        }
    }

    // A refused datagram (ICMP port unreachable) doesn't end the peer; the
    // reliable half decides that.
    if role.is_some() && status == Status::Disconnected {
        tracing::debug!(peer_id = %socket.peer_id(), "datagram endpoint unreachable");
        return Status::NotReady;
    }
    status
}
