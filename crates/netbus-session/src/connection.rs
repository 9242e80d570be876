//! The connection handshake state machine.
//!
//! A [`Connection`] owns one peer (or, for a wildcard address, a listener
//! and the clients it accepts) and follows its handshake purely by
//! listening to bus messages. Nothing calls into a connection from the
//! network thread; the six lifecycle messages arrive during
//! `dispatch_messages` like everything else.
//!
//! ```text
//!   open()                Connected           Accepted
//! NoConnection ──→ Connecting ──→ Unvalidated ──→ Valid
//!                       │              │
//!                       │              └──Rejected──→ Rejected (terminal)
//!                       └──ConnectionFailed / Disconnected──→ Disconnected (terminal)
//! ```
//!
//! The default [`ConnectionHandler`] hooks run a three-way handshake: the
//! host sends `Validate` to a client it accepted, the client answers with
//! `Validate`, and the host replies `Accepted`. Override the hooks to
//! check credentials, reject clients, or start game logic.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use netbus_bus::{BusError, MessageServer};
use netbus_protocol::{
    AcceptedMessage, Address, ConnectOrigin, ConnectedMessage, ConnectionFailedMessage,
    DisconnectedMessage, Message, MessageId, NetMessage, NetProtocol, PeerId, RejectedMessage,
    TypedMessage, ValidateMessage,
};

use crate::SessionError;

// ---------------------------------------------------------------------------
// PeerConnector
// ---------------------------------------------------------------------------

/// The routing layer as seen by a connection.
///
/// Implemented by the networking manager; tests use a stub.
pub trait PeerConnector: Send + Sync + 'static {
    /// Creates a peer for `address`. Returns [`PeerId::INVALID`] when the
    /// address is refused (for example, a peer for it already exists).
    fn connect(&self, address: Address) -> PeerId;

    /// Requests disconnection of one peer.
    fn disconnect_peer(&self, id: PeerId);

    /// Marks a peer as having completed the handshake.
    fn mark_validated(&self, id: PeerId);
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Where a connection (or one accepted client) is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    NoConnection,
    /// `open` was called; waiting for the sockets.
    Connecting,
    /// A wildcard address is bound and accepting clients.
    Listening,
    /// Sockets are up; the handshake is running.
    Unvalidated,
    /// The handshake finished.
    Valid,
    /// The remote refused the handshake. Terminal.
    Rejected,
    /// The sockets are gone. Terminal.
    Disconnected,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoConnection => "NoConnection",
            Self::Connecting => "Connecting",
            Self::Listening => "Listening",
            Self::Unvalidated => "Unvalidated",
            Self::Valid => "Valid",
            Self::Rejected => "Rejected",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// HandshakeContext
// ---------------------------------------------------------------------------

/// What a hook can see and do.
///
/// `peer()` is the peer the event concerns: the connection's own peer, or
/// an accepted client when the connection is listening.
pub struct HandshakeContext<'a> {
    bus: &'a MessageServer,
    connector: &'a dyn PeerConnector,
    peer: PeerId,
    host: bool,
    validated: bool,
}

impl<'a> HandshakeContext<'a> {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// `true` when the event concerns a client accepted by our listener.
    pub fn is_host(&self) -> bool {
        self.host
    }

    /// Sends `message` to the peer over its reliable socket.
    ///
    /// # Errors
    /// [`BusError::Overflow`] if the envelope can't be queued.
    pub fn send<T: TypedMessage>(&self, message: T) -> Result<(), BusError> {
        self.send_message(message.into_message())
    }

    pub fn send_message(&self, message: Message) -> Result<(), BusError> {
        let envelope = NetMessage::wrap(NetProtocol::Reliable(self.peer), message);
        self.bus.push_message(envelope.into_message())
    }

    /// Asks for (host) or answers (client) validation.
    pub fn validate(&self) -> Result<(), BusError> {
        self.send(ValidateMessage)
    }

    /// Accepts the peer: tells it so and marks it valid locally.
    pub fn accept(&mut self) -> Result<(), BusError> {
        self.send(AcceptedMessage)?;
        self.connector.mark_validated(self.peer);
        self.validated = true;
        Ok(())
    }

    /// Refuses the peer. The caller decides whether to also disconnect it.
    pub fn reject(&self, reason: impl Into<String>) -> Result<(), BusError> {
        self.send(RejectedMessage {
            reason: reason.into(),
        })
    }

    /// Requests disconnection of the peer.
    pub fn disconnect(&self) {
        self.connector.disconnect_peer(self.peer);
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandler
// ---------------------------------------------------------------------------

/// The six handshake hooks.
///
/// Every hook has a default, so `impl ConnectionHandler for MyGame {}` is
/// a working handshake that accepts everyone. Hooks run on the thread that
/// dispatches the bus, with the connection locked: don't call back into
/// the same [`Connection`] from a hook.
///
/// ## Which peer a hook sees
///
/// A connection to a concrete address has one peer, and `ctx.peer()` is
/// always that peer. A connection to a wildcard address is a listener:
/// its own `on_connected` fires once when the socket is bound, and every
/// later hook concerns one accepted client. `ctx.is_host()` tells the two
/// apart, which is how the defaults decide whether to ask for validation
/// or to answer it.
///
/// ## When hooks run
///
/// The connection has already moved to its new state when a hook runs,
/// so `on_accepted` sees `Valid` and `on_rejected` sees `Rejected`.
/// Handshake messages that arrive out of order (an `Accepted` before the
/// sockets are up, a `Rejected` after the handshake finished) are dropped
/// before any hook is called.
///
/// ## Errors
///
/// A hook returns [`BusError`] when a reply could not be queued. The
/// connection keeps the first such error for [`Connection::take_fault`];
/// a full bus means replies were lost and the handshake can't finish.
///
/// ```rust,ignore
/// struct Members(Vec<PeerId>);
///
/// impl ConnectionHandler for Members {
///     fn on_accepted(&mut self, ctx: &mut HandshakeContext<'_>) -> Result<(), BusError> {
///         self.0.push(ctx.peer());
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait ConnectionHandler: Send + 'static {
    /// Sockets are up. A host asks accepted clients to validate.
    fn on_connected(
        &mut self,
        ctx: &mut HandshakeContext<'_>,
        event: &ConnectedMessage,
    ) -> Result<(), BusError> {
        if ctx.is_host() {
            ctx.validate()
        } else {
            Ok(())
        }
    }

    /// A host receives a client's answer and accepts it; a client answers
    /// the host's request.
    fn on_validate(&mut self, ctx: &mut HandshakeContext<'_>, message: &Message) -> Result<(), BusError> {
        if ctx.is_host() {
            ctx.accept()
        } else {
            ctx.validate()
        }
    }

    fn on_accepted(&mut self, ctx: &mut HandshakeContext<'_>) -> Result<(), BusError> {
        Ok(())
    }

    fn on_rejected(
        &mut self,
        ctx: &mut HandshakeContext<'_>,
        event: &RejectedMessage,
    ) -> Result<(), BusError> {
        Ok(())
    }

    fn on_disconnected(&mut self, ctx: &mut HandshakeContext<'_>) -> Result<(), BusError> {
        Ok(())
    }

    fn on_connection_failed(&mut self, ctx: &mut HandshakeContext<'_>) -> Result<(), BusError> {
        Ok(())
    }
}

/// Runs the default handshake and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandshake;

impl ConnectionHandler for DefaultHandshake {}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Inner<H> {
    address: Address,
    peer_id: PeerId,
    state: ConnectionState,
    /// Clients accepted by our listener, with their own handshake state.
    children: HashMap<PeerId, ConnectionState>,
    fault: Option<BusError>,
    bus: Arc<MessageServer>,
    connector: Arc<dyn PeerConnector>,
    handler: H,
}

/// One handshake-tracked connection.
///
/// Dropping the connection closes it. Its bus receivers stay registered
/// (the bus has no removal) but turn into no-ops.
pub struct Connection<H: ConnectionHandler> {
    inner: Arc<Mutex<Inner<H>>>,
}

impl<H: ConnectionHandler> Connection<H> {
    /// Creates a closed connection and subscribes it to the six lifecycle
    /// messages.
    pub fn new(
        address: Address,
        bus: Arc<MessageServer>,
        connector: Arc<dyn PeerConnector>,
        handler: H,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            address,
            peer_id: PeerId::INVALID,
            state: ConnectionState::NoConnection,
            children: HashMap::new(),
            fault: None,
            bus: Arc::clone(&bus),
            connector,
            handler,
        }));

        for id in [
            ConnectedMessage::ID,
            ValidateMessage::ID,
            AcceptedMessage::ID,
            RejectedMessage::ID,
            DisconnectedMessage::ID,
            ConnectionFailedMessage::ID,
        ] {
            subscribe(&bus, id, Arc::downgrade(&inner));
        }

        Self { inner }
    }

    /// Asks the router for a peer.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyOpen`] while a peer is still owned
    /// - [`SessionError::Refused`] if the router returned an invalid id
    pub fn open(&self) -> Result<PeerId, SessionError> {
        let mut inner = self.lock();
        if inner.peer_id.is_valid() {
            return Err(SessionError::AlreadyOpen(inner.peer_id));
        }
        let id = inner.connector.connect(inner.address);
        if !id.is_valid() {
            tracing::warn!(address = %inner.address, "connection refused by router");
            return Err(SessionError::Refused(inner.address));
        }
        inner.peer_id = id;
        inner.state = ConnectionState::Connecting;
        inner.children.clear();
        tracing::info!(peer_id = %id, address = %inner.address, "connection opening");
        Ok(id)
    }

    /// Requests disconnection. The state changes when `Disconnected`
    /// arrives.
    ///
    /// A listening connection also disconnects every client it accepted.
    pub fn close(&self) {
        let inner = self.lock();
        if inner.peer_id.is_valid() {
            tracing::debug!(peer_id = %inner.peer_id, "connection closing");
            inner.connector.disconnect_peer(inner.peer_id);
            inner.disconnect_children();
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// The owned peer, or [`PeerId::INVALID`] when closed.
    pub fn peer_id(&self) -> PeerId {
        self.lock().peer_id
    }

    pub fn address(&self) -> Address {
        self.lock().address
    }

    /// Handshake state of a client accepted by this (listening) connection.
    pub fn child_state(&self, id: PeerId) -> Option<ConnectionState> {
        self.lock().children.get(&id).copied()
    }

    /// Clients accepted by this connection that are still connected.
    pub fn children(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.lock().children.keys().copied().collect();
        ids.sort();
        ids
    }

    /// The first bus error a hook returned, if any. A full bus is fatal.
    pub fn take_fault(&self) -> Option<BusError> {
        self.lock().fault.take()
    }

    /// Runs `f` against the handler, for reading application state it
    /// collected.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.lock().handler)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: ConnectionHandler> Drop for Connection<H> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<H: ConnectionHandler> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Connection")
            .field("address", &inner.address)
            .field("peer_id", &inner.peer_id)
            .field("state", &inner.state)
            .field("children", &inner.children.len())
            .finish()
    }
}

fn subscribe<H: ConnectionHandler>(bus: &MessageServer, id: MessageId, inner: Weak<Mutex<Inner<H>>>) {
    bus.add_message_receiver(id, move |message| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handle(message);
    });
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

/// Which peer an event is about, from this connection's point of view.
enum Target {
    Own,
    Child(PeerId),
}

impl<H: ConnectionHandler> Inner<H> {
    fn handle(&mut self, message: &Message) {
        let result = match message.id() {
            ConnectedMessage::ID => self.parse(message).map_or(Ok(()), |e| self.on_connected(e)),
            DisconnectedMessage::ID => self
                .parse::<DisconnectedMessage>(message)
                .map_or(Ok(()), |e| self.on_gone(e.peer_id, false)),
            ConnectionFailedMessage::ID => self
                .parse::<ConnectionFailedMessage>(message)
                .map_or(Ok(()), |e| self.on_gone(e.peer_id, true)),
            _ => self.on_remote(message),
        };
        if let Err(e) = result {
            tracing::error!(peer_id = %self.peer_id, error = %e, "handshake reply lost");
            self.fault.get_or_insert(e);
        }
    }

    fn parse<T: TypedMessage>(&self, message: &Message) -> Option<T> {
        match T::from_message(message) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "malformed lifecycle message");
                None
            }
        }
    }

    fn target(&self, peer: PeerId) -> Option<Target> {
        if !peer.is_valid() {
            None
        } else if peer == self.peer_id {
            Some(Target::Own)
        } else if self.children.contains_key(&peer) {
            Some(Target::Child(peer))
        } else {
            None
        }
    }

    fn on_connected(&mut self, event: ConnectedMessage) -> Result<(), BusError> {
        let host = match event.origin {
            ConnectOrigin::Accepted { listener }
                if listener == self.peer_id && self.state == ConnectionState::Listening =>
            {
                self.children.insert(event.peer_id, ConnectionState::Unvalidated);
                tracing::info!(listener = %listener, peer_id = %event.peer_id, "client joined");
                true
            }
            _ if event.peer_id == self.peer_id && self.state == ConnectionState::Connecting => {
                self.state = match event.origin {
                    ConnectOrigin::Listening => ConnectionState::Listening,
                    _ => ConnectionState::Unvalidated,
                };
                false
            }
            _ => {
                if event.peer_id == self.peer_id {
                    tracing::debug!(
                        peer_id = %event.peer_id,
                        state = %self.state,
                        "unexpected connect ignored"
                    );
                }
                return Ok(());
            }
        };
        self.run_hook(event.peer_id, host, |handler, ctx| handler.on_connected(ctx, &event))
    }

    /// `Validate`, `Accepted` and `Rejected` come from the wire; the origin
    /// says which peer sent them.
    fn on_remote(&mut self, message: &Message) -> Result<(), BusError> {
        let Some(origin) = message.origin() else {
            return Ok(());
        };
        let Some(target) = self.target(origin) else {
            return Ok(());
        };
        let host = matches!(target, Target::Child(_));
        let state = match target {
            Target::Own => self.state,
            Target::Child(id) => self.children.get(&id).copied().unwrap_or_default(),
        };

        // Every remote step is only legal mid-handshake.
        if state != ConnectionState::Unvalidated {
            tracing::debug!(
                peer_id = %origin,
                %state,
                id = message.id(),
                "out-of-order handshake message ignored"
            );
            return Ok(());
        }

        match message.id() {
            ValidateMessage::ID => {
                self.run_hook(origin, host, |handler, ctx| handler.on_validate(ctx, message))
            }
            AcceptedMessage::ID => {
                self.set_state(&target, ConnectionState::Valid);
                self.connector.mark_validated(origin);
                tracing::info!(peer_id = %origin, "handshake accepted");
                self.run_hook(origin, host, |handler, ctx| handler.on_accepted(ctx))
            }
            RejectedMessage::ID => {
                let Some(event) = self.parse::<RejectedMessage>(message) else {
                    return Ok(());
                };
                self.set_state(&target, ConnectionState::Rejected);
                tracing::info!(peer_id = %origin, reason = %event.reason, "handshake rejected");
                self.run_hook(origin, host, |handler, ctx| handler.on_rejected(ctx, &event))
            }
            _ => Ok(()),
        }
    }

    fn on_gone(&mut self, peer: PeerId, failed: bool) -> Result<(), BusError> {
        let Some(target) = self.target(peer) else {
            return Ok(());
        };
        let host = match target {
            Target::Own => {
                if !self.state.is_terminal() {
                    self.state = ConnectionState::Disconnected;
                }
                self.peer_id = PeerId::INVALID;
                // A gone listener takes its clients along.
                self.disconnect_children();
                self.children.clear();
                false
            }
            Target::Child(id) => {
                self.children.remove(&id);
                true
            }
        };
        tracing::info!(peer_id = %peer, failed, "connection closed");
        self.run_hook(peer, host, |handler, ctx| {
            if failed {
                handler.on_connection_failed(ctx)
            } else {
                handler.on_disconnected(ctx)
            }
        })
    }

    fn disconnect_children(&self) {
        for id in self.children.keys() {
            tracing::debug!(peer_id = %id, "disconnecting accepted client");
            self.connector.disconnect_peer(*id);
        }
    }

    fn set_state(&mut self, target: &Target, state: ConnectionState) {
        match target {
            Target::Own => self.state = state,
            Target::Child(id) => {
                self.children.insert(*id, state);
            }
        }
    }

    fn run_hook(
        &mut self,
        peer: PeerId,
        host: bool,
        hook: impl FnOnce(&mut H, &mut HandshakeContext<'_>) -> Result<(), BusError>,
    ) -> Result<(), BusError> {
        let mut ctx = HandshakeContext {
            bus: &self.bus,
            connector: self.connector.as_ref(),
            peer,
            host,
            validated: false,
        };
        let result = hook(&mut self.handler, &mut ctx);
        let validated = ctx.validated;
        if validated && host {
            self.children.insert(peer, ConnectionState::Valid);
        }
        result
    }
}
