//! Message bus for netbus.
//!
//! [`MessageServer`] is the hand-off point between the network thread and
//! game logic. Producers push owned [`Message`](netbus_protocol::Message)s;
//! the application thread dispatches them to receivers once per tick.

mod error;
mod server;

pub use error::BusError;
pub use server::{BusConfig, MessageServer, Receiver};
