//! The unit of communication on the bus: [`Message`].
//!
//! A message is a numeric id, a [`Packet`] of body bytes, an optional
//! origin peer, and an optional one-shot callback. Ids are derived from a
//! type name at compile time with [`message_id`], so two processes agree
//! on an id without any registration step.
//!
//! ## Wire form
//!
//! When a message crosses the network only the id and the body travel:
//!
//! ```text
//! [id: u32 BE][packet bytes ...]
//! ```
//!
//! The origin is stamped on the receiving side, and callbacks never leave
//! the process.

use std::fmt;

use crate::{Packet, PacketError, PeerId};

#[cfg(feature = "json")]
use crate::{Codec, ProtocolError};

/// Numeric message type identifier.
pub type MessageId = u32;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Hashes a type name into a [`MessageId`] (32-bit FNV-1a).
///
/// This is a `const fn`, so ids can be computed in constant position:
///
/// ```rust
/// use netbus_protocol::{message_id, MessageId};
///
/// const CHAT: MessageId = message_id("ChatMessage");
/// assert_eq!(CHAT, message_id("ChatMessage"));
/// assert_ne!(CHAT, message_id("ChatMessage2"));
/// ```
pub const fn message_id(name: &str) -> MessageId {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// A callback run once after every receiver has seen the message.
pub type MessageCallback = Box<dyn FnOnce(&Message) + Send + 'static>;

/// A message travelling through the bus.
///
/// `Message` is deliberately not `Clone`: its callback is `FnOnce`, and the
/// bus owns each message exactly once. Receivers get `&Message`; use
/// [`reader`](Self::reader) to parse the body from a shared reference.
pub struct Message {
    id: MessageId,
    packet: Packet,
    origin: Option<PeerId>,
    callback: Option<MessageCallback>,
}

impl Message {
    /// Creates a message with an empty body.
    pub fn new(id: MessageId) -> Self {
        Self::with_packet(id, Packet::new())
    }

    pub fn with_packet(id: MessageId, packet: Packet) -> Self {
        Self {
            id,
            packet,
            origin: None,
            callback: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    pub fn into_packet(self) -> Packet {
        self.packet
    }

    /// A fresh read cursor over the body, for receivers holding `&Message`.
    pub fn reader(&self) -> Packet {
        Packet::from_bytes(self.packet.as_bytes().to_vec())
    }

    /// The peer this message arrived from, or `None` if it was produced
    /// locally.
    pub fn origin(&self) -> Option<PeerId> {
        self.origin
    }

    pub fn set_origin(&mut self, peer: PeerId) {
        self.origin = Some(peer);
    }

    pub fn with_origin(mut self, peer: PeerId) -> Self {
        self.origin = Some(peer);
        self
    }

    /// Attaches a callback that runs after dispatch. Replaces any previous
    /// callback.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Message) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Runs and clears the callback. A second call does nothing.
    pub fn run_callback(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }

    /// Serializes the id and body for the wire. The origin and callback
    /// are not included.
    pub fn to_wire(&self) -> Vec<u8> {
        let body = self.packet.as_bytes();
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    /// Splits a wire payload back into an id and a body.
    ///
    /// # Errors
    /// [`PacketError::Truncated`] if there aren't even four bytes for the id.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut packet = Packet::from_bytes(bytes.to_vec());
        let id = packet.read_u32()?;
        Ok(Self::with_packet(id, Packet::from_bytes(packet.read_rest())))
    }

    /// Builds a message whose body is `value` encoded by `codec`.
    ///
    /// ```rust
    /// use netbus_protocol::{message_id, JsonCodec, Message};
    ///
    /// let msg = Message::encode_body(message_id("Score"), &JsonCodec, &42u32).unwrap();
    /// let score: u32 = msg.decode_body(&JsonCodec).unwrap();
    /// assert_eq!(score, 42);
    /// ```
    #[cfg(feature = "json")]
    pub fn encode_body<C, T>(
        id: MessageId,
        codec: &C,
        value: &T,
    ) -> Result<Self, ProtocolError>
    where
        C: Codec,
        T: serde::Serialize,
    {
        let bytes = codec.encode(value)?;
        Ok(Self::with_packet(id, Packet::from_bytes(bytes)))
    }

    /// Decodes the whole body with `codec`.
    #[cfg(feature = "json")]
    pub fn decode_body<C, T>(&self, codec: &C) -> Result<T, ProtocolError>
    where
        C: Codec,
        T: serde::de::DeserializeOwned,
    {
        codec.decode(self.packet.as_bytes())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("len", &self.packet.len())
            .field("origin", &self.origin)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TypedMessage
// ---------------------------------------------------------------------------

/// A Rust type with a fixed message id and a binary body layout.
///
/// Implementors write their fields into a [`Packet`] and read them back
/// in the same order. The provided methods handle the id bookkeeping.
pub trait TypedMessage: Sized {
    const ID: MessageId;

    fn write_body(&self, packet: &mut Packet);

    fn read_body(packet: &mut Packet) -> Result<Self, PacketError>;

    fn into_message(self) -> Message {
        let mut packet = Packet::new();
        self.write_body(&mut packet);
        Message::with_packet(Self::ID, packet)
    }

    /// Parses `message` as `Self`.
    ///
    /// # Errors
    /// [`PacketError::WrongMessage`] if the ids differ, or whatever the
    /// body reader reports.
    fn from_message(message: &Message) -> Result<Self, PacketError> {
        if message.id() != Self::ID {
            return Err(PacketError::WrongMessage {
                expected: Self::ID,
                actual: message.id(),
            });
        }
        Self::read_body(&mut message.reader())
    }
}
