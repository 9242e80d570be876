use netbus_bus::BusError;

/// Errors that stop the transport as a whole.
///
/// Individual socket failures are [`Status`](crate::Status) values and end
/// up on the bus as lifecycle messages; only these reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The single-threaded runtime for the socket thread couldn't be built.
    #[error("failed to build socket runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The OS refused to spawn the socket thread.
    #[error("failed to spawn socket thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The socket thread couldn't publish to a full bus and stopped.
    #[error(transparent)]
    BusOverflow(#[from] BusError),

    /// The socket thread panicked.
    #[error("socket thread panicked")]
    Panicked,

    /// The socket thread exited while its handle is still in use. Call
    /// `shutdown` to learn why.
    #[error("socket thread stopped")]
    Stopped,
}
