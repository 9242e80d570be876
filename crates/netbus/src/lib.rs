//! # netbus
//!
//! Peer-to-peer networking and a message bus for games.
//!
//! Game code lives on one thread and only ever sees messages. A dedicated
//! socket thread reads and writes TCP and UDP, and everything it learns
//! (peers connecting, frames arriving, peers leaving) is pushed onto a
//! [`MessageServer`]. The game thread calls
//! [`NetworkingManager::dispatch_messages`] once per tick and its receivers
//! run there.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netbus::prelude::*;
//!
//! # fn main() -> Result<(), NetbusError> {
//! netbus::logging::init();
//! let net = Arc::new(NetworkingManager::builder().build()?);
//!
//! let connection = Connection::new(
//!     Address::resolve("127.0.0.1", 7000)?,
//!     Arc::clone(net.bus()),
//!     net.clone(),
//!     DefaultHandshake,
//! );
//! connection.open()?;
//!
//! loop {
//!     net.dispatch_messages()?;
//!     if connection.state() == ConnectionState::Valid {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod logging;
mod routing;

pub use config::NetConfig;
pub use error::NetbusError;
pub use routing::{NetworkingManager, NetworkingManagerBuilder};

pub use netbus_bus::{BusConfig, BusError, MessageServer};
pub use netbus_protocol as protocol;
pub use netbus_session::{
    Connection, ConnectionHandler, ConnectionState, DefaultHandshake, HandshakeContext,
    PeerConnector, SessionError,
};
pub use netbus_transport::{PeerState, SocketKind, TransportError};

/// The types most applications need.
pub mod prelude {
    pub use crate::{
        BusError, Connection, ConnectionHandler, ConnectionState, DefaultHandshake,
        HandshakeContext, MessageServer, NetConfig, NetbusError, NetworkingManager, PeerState,
    };
    pub use netbus_protocol::{
        Address, ConnectOrigin, ConnectedMessage, DisconnectedMessage, Message, MessageId,
        NetMessage, NetProtocol, PeerId, RejectedMessage, TypedMessage, message_id,
    };
}
