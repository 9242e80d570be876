//! The outcome of a single non-blocking socket operation.

use std::io;

/// What happened when a socket tried to read, write, or connect.
///
/// Per-call outcomes are values, not errors: the multiplexer retries
/// `NotReady` and `Partial` on its next iteration and tears the peer down
/// on `Disconnected` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation completed.
    Done,
    /// Nothing could be done without blocking.
    NotReady,
    /// Some bytes moved, but the current frame isn't finished.
    Partial,
    /// The remote closed the connection.
    Disconnected,
    /// Anything else. The socket is unusable.
    Error,
}

impl Status {
    /// `true` for the outcomes that end a socket's life.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    pub fn from_io_error(err: &io::Error) -> Self {
        Self::from_kind(err.kind())
    }

    pub fn from_kind(kind: io::ErrorKind) -> Self {
        use io::ErrorKind::*;
        match kind {
            WouldBlock | Interrupted => Self::NotReady,
            ConnectionReset | ConnectionAborted | TimedOut | NotConnected | BrokenPipe => {
                Self::Disconnected
            }
            _ => Self::Error,
        }
    }
}

impl From<&io::Error> for Status {
    fn from(err: &io::Error) -> Self {
        Self::from_io_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_kind_maps_blocking_to_not_ready() {
        assert_eq!(Status::from_kind(io::ErrorKind::WouldBlock), Status::NotReady);
        assert_eq!(Status::from_kind(io::ErrorKind::Interrupted), Status::NotReady);
    }

    #[test]
    fn test_from_kind_maps_resets_to_disconnected() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut,
            io::ErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe,
        ] {
            assert_eq!(Status::from_kind(kind), Status::Disconnected, "{kind:?}");
        }
    }

    #[test]
    fn test_from_kind_other_is_error() {
        assert_eq!(Status::from_kind(io::ErrorKind::AddrInUse), Status::Error);
        assert_eq!(Status::from_kind(io::ErrorKind::PermissionDenied), Status::Error);
        let err = io::Error::other("boom");
        assert_eq!(Status::from(&err), Status::Error);
    }

    #[test]
    fn test_is_terminal() {
        assert!(Status::Disconnected.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::Partial.is_terminal());
        assert!(!Status::NotReady.is_terminal());
        assert!(!Status::Done.is_terminal());
    }
}
