//! Connection handshakes for netbus.
//!
//! Sockets coming up is not the same as a peer being trusted. This crate
//! tracks the step in between:
//!
//! 1. **Opening**: a [`Connection`] asks a [`PeerConnector`] for a peer.
//! 2. **Handshake**: `Connected`, `Validate`, `Accepted` and `Rejected`
//!    messages arrive on the bus and move the [`ConnectionState`].
//! 3. **Policy**: a [`ConnectionHandler`] decides what to send at each
//!    step. [`DefaultHandshake`] accepts everyone.
//!
//! # How it fits in the stack
//!
//! ```text
//! Application (above)  ← implements ConnectionHandler
//!     ↕
//! Session Layer (this crate)  ← follows lifecycle messages per connection
//!     ↕
//! Bus + Protocol (below)  ← MessageServer, lifecycle message types
//! ```

mod connection;
mod error;

pub use connection::{
    Connection, ConnectionHandler, ConnectionState, DefaultHandshake, HandshakeContext,
    PeerConnector,
};
pub use error::SessionError;
