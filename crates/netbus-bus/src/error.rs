//! Error types for the message bus.

/// Errors returned by [`MessageServer`](crate::MessageServer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The FIFO already holds `capacity` messages.
    ///
    /// The pushed message is dropped, never an older one. Inside the library
    /// this is treated as fatal: a bus that can't keep up has lost messages
    /// the handshake depends on.
    #[error("message bus overflow (capacity {capacity})")]
    Overflow { capacity: usize },
}
