//! Protocol layer for netbus.
//!
//! This crate defines what travels on the bus and on the wire:
//!
//! - **Addresses** ([`Address`]) and their resolution rules.
//! - **Messages** ([`Message`], [`Packet`], [`message_id`]): an id plus a
//!   big-endian byte body.
//! - **Envelopes** ([`NetMessage`], [`NetProtocol`]): routing instructions
//!   wrapped around another message.
//! - **Lifecycle events** ([`ConnectedMessage`] and friends) that drive
//!   handshakes.
//! - **Factories** ([`MessageFactory`]) that rebuild messages from raw bytes.
//! - **Codecs** ([`Codec`], [`JsonCodec`]) for serde-typed bodies.
//!
//! It knows nothing about sockets or threads.
//!
//! ```text
//! Transport (frames) → Protocol (Message) → Bus (receivers)
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

pub mod address;
mod codec;
mod envelope;
mod error;
mod events;
mod factory;
mod message;
mod packet;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use address::Address;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use envelope::{NetMessage, NetProtocol};
pub use error::{AddressError, PacketError, ProtocolError};
pub use events::{
    AcceptedMessage, ConnectOrigin, ConnectedMessage, ConnectionFailedMessage,
    DisconnectedMessage, RejectedMessage, ValidateMessage,
};
pub use factory::{MessageFactory, MessageRegistry, PassthroughFactory};
pub use message::{Message, MessageCallback, MessageId, TypedMessage, message_id};
pub use packet::Packet;
pub use types::PeerId;
