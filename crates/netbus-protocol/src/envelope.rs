//! The network envelope: a message that tells the router where another
//! message should go.
//!
//! Application code never writes to sockets. It wraps the message it wants
//! delivered in a [`NetMessage`], names a [`NetProtocol`], and pushes the
//! envelope onto the bus. The router picks it up and either re-publishes
//! the child locally or queues it on the right peer sockets.
//!
//! ```rust
//! use netbus_protocol::{message_id, Message, NetMessage, NetProtocol, PeerId};
//!
//! let chat = Message::new(message_id("Chat"));
//! let envelope = NetMessage::wrap(NetProtocol::Reliable(PeerId(2)), chat).into_message();
//!
//! let back = NetMessage::from_message(&envelope).unwrap();
//! assert_eq!(back.protocol, NetProtocol::Reliable(PeerId(2)));
//! assert_eq!(back.child_id, message_id("Chat"));
//! ```

use crate::{Message, MessageId, Packet, PacketError, PeerId, TypedMessage, message_id};

/// Where an enveloped message should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetProtocol {
    /// Re-publish the child on the local bus. Nothing is sent.
    LocalOnly,
    /// Send to every known peer over its unreliable socket.
    BroadcastUnreliable,
    /// Send to every known peer over its reliable socket.
    BroadcastReliable,
    /// Send to one peer over its unreliable socket.
    Unreliable(PeerId),
    /// Send to one peer over its reliable socket.
    Reliable(PeerId),
}

impl NetProtocol {
    fn tag(self) -> u8 {
        match self {
            Self::LocalOnly => 0,
            Self::BroadcastUnreliable => 1,
            Self::BroadcastReliable => 2,
            Self::Unreliable(_) => 3,
            Self::Reliable(_) => 4,
        }
    }

    /// The destination peer for unicast protocols.
    pub fn destination(self) -> Option<PeerId> {
        match self {
            Self::Unreliable(to) | Self::Reliable(to) => Some(to),
            _ => None,
        }
    }

    /// `true` for the protocols that use the reliable socket.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::BroadcastReliable | Self::Reliable(_))
    }
}

/// An envelope carrying one child message.
///
/// Body layout: `[tag u8][to i32, unicast only][child id u32][child blob]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    pub protocol: NetProtocol,
    pub child_id: MessageId,
    pub payload: Vec<u8>,
}

impl NetMessage {
    /// Wraps `child`. Its origin and callback are dropped; only the id and
    /// body are carried.
    pub fn wrap(protocol: NetProtocol, child: Message) -> Self {
        Self {
            protocol,
            child_id: child.id(),
            payload: child.into_packet().into_bytes(),
        }
    }

    /// Rebuilds the child as a plain message, without going through a
    /// factory.
    pub fn child(&self) -> Message {
        Message::with_packet(self.child_id, Packet::from_bytes(self.payload.clone()))
    }
}

impl TypedMessage for NetMessage {
    const ID: MessageId = message_id("NetMessage");

    fn write_body(&self, packet: &mut Packet) {
        packet.write_u8(self.protocol.tag());
        if let Some(to) = self.protocol.destination() {
            packet.write_i32(to.0);
        }
        packet.write_u32(self.child_id).write_blob(&self.payload);
    }

    fn read_body(packet: &mut Packet) -> Result<Self, PacketError> {
        let protocol = match packet.read_u8()? {
            0 => NetProtocol::LocalOnly,
            1 => NetProtocol::BroadcastUnreliable,
            2 => NetProtocol::BroadcastReliable,
            3 => NetProtocol::Unreliable(PeerId(packet.read_i32()?)),
            4 => NetProtocol::Reliable(PeerId(packet.read_i32()?)),
            tag => {
                return Err(PacketError::UnknownTag {
                    kind: "net protocol",
                    tag,
                });
            }
        };
        let child_id = packet.read_u32()?;
        let payload = packet.read_blob()?;
        Ok(Self {
            protocol,
            child_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_body_has_no_destination_field() {
        let envelope = NetMessage {
            protocol: NetProtocol::BroadcastReliable,
            child_id: 0x0102_0304,
            payload: vec![9],
        };
        let msg = envelope.into_message();
        assert_eq!(
            msg.packet().as_bytes(),
            &[2, 1, 2, 3, 4, 0, 0, 0, 1, 9]
        );
    }

    #[test]
    fn test_unicast_body_carries_destination() {
        let envelope = NetMessage {
            protocol: NetProtocol::Unreliable(PeerId(7)),
            child_id: 1,
            payload: Vec::new(),
        };
        let msg = envelope.clone().into_message();
        assert_eq!(&msg.packet().as_bytes()[..5], &[3, 0, 0, 0, 7]);
        assert_eq!(NetMessage::from_message(&msg).unwrap(), envelope);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut packet = Packet::new();
        packet.write_u8(42);
        let msg = Message::with_packet(NetMessage::ID, packet);
        assert_eq!(
            NetMessage::from_message(&msg),
            Err(PacketError::UnknownTag {
                kind: "net protocol",
                tag: 42
            })
        );
    }

    #[test]
    fn test_wrap_drops_origin_keeps_body() {
        let mut child = Message::new(11).with_origin(PeerId(3));
        child.packet_mut().write_str("hi");
        let envelope = NetMessage::wrap(NetProtocol::LocalOnly, child);

        let mut rebuilt = envelope.child();
        assert_eq!(rebuilt.id(), 11);
        assert_eq!(rebuilt.origin(), None);
        assert_eq!(rebuilt.packet_mut().read_string().unwrap(), "hi");
    }

    #[test]
    fn test_protocol_helpers() {
        assert_eq!(NetProtocol::Reliable(PeerId(1)).destination(), Some(PeerId(1)));
        assert_eq!(NetProtocol::BroadcastUnreliable.destination(), None);
        assert!(NetProtocol::BroadcastReliable.is_reliable());
        assert!(!NetProtocol::Unreliable(PeerId(1)).is_reliable());
    }
}
