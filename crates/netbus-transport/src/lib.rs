//! Transport layer for netbus.
//!
//! Everything that touches an OS socket lives here:
//!
//! - [`Status`]: the outcome taxonomy for non-blocking I/O.
//! - [`frame`]: length-prefixed framing over [`StreamIo`] / [`DatagramIo`].
//! - [`Socket`]: one reliable (TCP) or unreliable (UDP) endpoint.
//! - [`Peer`] and [`PeerRegistry`]: a remote identity and the shared list of
//!   them.
//! - [`SocketManager`]: the dedicated thread that multiplexes every socket
//!   and publishes what arrives onto the bus.
//!
//! ```text
//! Peer (outboxes) ──store──→ SocketManager thread ──frames──→ MessageServer
//! ```

mod error;
pub mod frame;
mod manager;
mod peer;
mod socket;
mod status;

pub use error::TransportError;
pub use frame::{DatagramIo, FrameAssembler, OutboundQueue, StreamIo};
pub use manager::{SocketManager, SocketManagerConfig};
pub use peer::{Peer, PeerRegistry, PeerSockets, PeerState};
pub use socket::{DatagramRole, Frame, Outbox, Socket, SocketKind};
pub use status::Status;
