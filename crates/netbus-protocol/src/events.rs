//! Connection lifecycle messages.
//!
//! These six messages drive every handshake. The I/O thread publishes
//! [`ConnectedMessage`], [`DisconnectedMessage`] and
//! [`ConnectionFailedMessage`] onto the local bus. [`ValidateMessage`],
//! [`AcceptedMessage`] and [`RejectedMessage`] travel between peers inside
//! reliable envelopes and arrive with their origin stamped, which is how a
//! receiver knows which peer they concern.

use std::net::IpAddr;

use crate::{Address, MessageId, Packet, PacketError, PeerId, TypedMessage, message_id};

/// How a peer came to be connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectOrigin {
    /// We dialed out and the remote accepted.
    Outbound,
    /// A wildcard address was bound and is now accepting clients.
    Listening,
    /// A client connected to one of our listeners.
    Accepted { listener: PeerId },
}

/// Published once per peer when its sockets are live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedMessage {
    pub peer_id: PeerId,
    pub address: Address,
    pub origin: ConnectOrigin,
}

impl TypedMessage for ConnectedMessage {
    const ID: MessageId = message_id("ConnectedMessage");

    fn write_body(&self, packet: &mut Packet) {
        packet
            .write_i32(self.peer_id.0)
            .write_str(&self.address.to_canonical_string(false))
            .write_u32(u32::from(self.address.port()));
        match self.origin {
            ConnectOrigin::Outbound => {
                packet.write_u8(0);
            }
            ConnectOrigin::Listening => {
                packet.write_u8(1);
            }
            ConnectOrigin::Accepted { listener } => {
                packet.write_u8(2).write_i32(listener.0);
            }
        }
    }

    fn read_body(packet: &mut Packet) -> Result<Self, PacketError> {
        let peer_id = PeerId(packet.read_i32()?);
        let host = packet.read_string()?;
        let ip: IpAddr = host.parse().map_err(|_| PacketError::InvalidAddress(host))?;
        // Ports above u16::MAX can't be produced by `write_body`.
        let port = u16::try_from(packet.read_u32()?)
            .map_err(|_| PacketError::InvalidAddress(ip.to_string()))?;
        let origin = match packet.read_u8()? {
            0 => ConnectOrigin::Outbound,
            1 => ConnectOrigin::Listening,
            2 => ConnectOrigin::Accepted {
                listener: PeerId(packet.read_i32()?),
            },
            tag => {
                return Err(PacketError::UnknownTag {
                    kind: "connect origin",
                    tag,
                });
            }
        };
        Ok(Self {
            peer_id,
            address: Address::from_socket_addr((ip, port).into()),
            origin,
        })
    }
}

/// Sent by the accepting side to ask the dialer to identify itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidateMessage;

impl TypedMessage for ValidateMessage {
    const ID: MessageId = message_id("ValidateMessage");

    fn write_body(&self, _packet: &mut Packet) {}

    fn read_body(_packet: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self)
    }
}

/// The handshake succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptedMessage;

impl TypedMessage for AcceptedMessage {
    const ID: MessageId = message_id("AcceptedMessage");

    fn write_body(&self, _packet: &mut Packet) {}

    fn read_body(_packet: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self)
    }
}

/// The handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RejectedMessage {
    pub reason: String,
}

impl TypedMessage for RejectedMessage {
    const ID: MessageId = message_id("RejectedMessage");

    fn write_body(&self, packet: &mut Packet) {
        packet.write_str(&self.reason);
    }

    fn read_body(packet: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self {
            reason: packet.read_string()?,
        })
    }
}

/// A live peer's sockets were closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectedMessage {
    pub peer_id: PeerId,
}

impl TypedMessage for DisconnectedMessage {
    const ID: MessageId = message_id("DisconnectedMessage");

    fn write_body(&self, packet: &mut Packet) {
        packet.write_i32(self.peer_id.0);
    }

    fn read_body(packet: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self {
            peer_id: PeerId(packet.read_i32()?),
        })
    }
}

/// A pending peer never came up (refused, timed out, or cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionFailedMessage {
    pub peer_id: PeerId,
}

impl TypedMessage for ConnectionFailedMessage {
    const ID: MessageId = message_id("ConnectionFailedMessage");

    fn write_body(&self, packet: &mut Packet) {
        packet.write_i32(self.peer_id.0);
    }

    fn read_body(packet: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self {
            peer_id: PeerId(packet.read_i32()?),
        })
    }
}
