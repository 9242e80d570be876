//! Error types for the protocol layer.
//!
//! The protocol layer has three distinct failure families, so it gets three
//! enums instead of one catch-all. An `AddressError` means "you can't even
//! start connecting", a `PacketError` means "these bytes don't say what you
//! asked them to say", and a `ProtocolError` comes from a payload codec.

/// Errors produced while resolving a textual host into an [`Address`].
///
/// Resolution failures are not recoverable: the caller must not go on to
/// open a connection with a half-built address.
///
/// [`Address`]: crate::Address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The text contains a character outside `[0-9a-fA-F.:%/-]`.
    #[error("invalid character {character:?} in address {text:?}")]
    InvalidCharacters { text: String, character: char },

    /// The system resolver couldn't turn the text into an IP address.
    #[error("could not resolve address {0:?}")]
    Unresolved(String),

    /// The port leaves no room for the unreliable companion port (`port + 1`).
    #[error("port {0} is out of range (the unreliable port would overflow)")]
    PortOutOfRange(u16),
}

/// Errors produced while reading typed values out of a [`Packet`].
///
/// [`Packet`]: crate::Packet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// A read asked for more bytes than the packet has left.
    #[error("packet truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A length-prefixed string was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// An enum tag byte had no matching variant.
    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: u8 },

    /// A text field that should hold an IP address didn't parse as one.
    #[error("invalid address field {0:?}")]
    InvalidAddress(String),

    /// A typed view was requested for a message with a different id.
    #[error("expected message id {expected:#010x}, got {actual:#010x}")]
    WrongMessage { expected: u32, actual: u32 },
}

/// Errors from a payload [`Codec`](crate::Codec).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields, or a
    /// message whose body was written by a different type.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The body bytes couldn't be extracted from the packet at all.
    #[error(transparent)]
    Packet(#[from] PacketError),
}
