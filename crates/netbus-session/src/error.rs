//! Error types for the session layer.

use netbus_bus::BusError;
use netbus_protocol::{Address, PeerId};

/// Errors from opening or driving a [`Connection`](crate::Connection).
///
/// A rejected handshake is not an error: it shows up as
/// [`ConnectionState::Rejected`](crate::ConnectionState::Rejected).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `open` was called while the connection still owns a peer. Close it
    /// and wait for the disconnect first.
    #[error("connection already open as {0}")]
    AlreadyOpen(PeerId),

    /// The router refused the address, usually because a peer for it
    /// already exists.
    #[error("router refused to connect to {0}")]
    Refused(Address),

    /// A handshake reply couldn't be published.
    #[error(transparent)]
    Bus(#[from] BusError),
}
