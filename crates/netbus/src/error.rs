//! Unified error type for netbus.

use netbus_bus::BusError;
use netbus_protocol::{AddressError, PacketError, ProtocolError};
use netbus_session::SessionError;
use netbus_transport::TransportError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` conversions let `?` lift sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum NetbusError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The bus was full. Fatal.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The socket thread couldn't start, or stopped on its own.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use netbus_protocol::{Address, PeerId};

    use super::*;

    #[test]
    fn test_from_bus_error_keeps_message() {
        let err: NetbusError = BusError::Overflow { capacity: 8 }.into();
        assert!(matches!(err, NetbusError::Bus(_)));
        assert!(err.to_string().contains('8'));
    }

    #[test]
    fn test_from_transport_error() {
        let err: NetbusError = TransportError::Panicked.into();
        assert!(matches!(err, NetbusError::Transport(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err: NetbusError = SessionError::AlreadyOpen(PeerId(3)).into();
        assert!(matches!(err, NetbusError::Session(_)));
        assert!(err.to_string().contains("peer-3"));
    }

    #[test]
    fn test_from_address_error() {
        let err = Address::resolve("not an address!", 1).unwrap_err();
        let err: NetbusError = err.into();
        assert!(matches!(err, NetbusError::Address(_)));
    }
}
