//! Codec trait for application payloads.
//!
//! The handshake and envelope messages have hand-written binary layouts
//! (see [`TypedMessage`](crate::TypedMessage)). Application messages usually
//! don't need that: any `serde` type can be put into a message body with a
//! [`Codec`], via [`Message::encode_body`](crate::Message::encode_body) and
//! [`Message::decode_body`](crate::Message::decode_body).
//!
//! [`JsonCodec`] is the one we ship. It's easy to read in a packet capture,
//! which matters more than size while a game is being built.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes Rust values to body bytes and decodes them back.
///
/// ## Trait bounds
///
/// - `Send + Sync`: a codec is captured by receivers, and receivers can be
///   registered from any thread and run on the dispatching one.
/// - `'static`: receivers are boxed closures that outlive the call that
///   registered them, so anything they capture must own its data.
///
/// ## Generic methods
///
/// `encode` and `decode` are generic over the value type rather than the
/// trait being generic over it. One codec value then handles every message
/// type a game defines, and `Message::decode_body::<_, Chat>(&codec)`
/// picks the type at the call site. The cost is that `Codec` is not object
/// safe; pass it by generic parameter, not as `dyn Codec`.
///
/// `decode` asks for [`DeserializeOwned`] because the packet a message body
/// lives in is dropped after dispatch. A decoded value can't borrow from it.
pub trait Codec: Send + Sync + 'static {
    /// # Errors
    /// `ProtocolError::Encode` if the value can't be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// # Errors
    /// `ProtocolError::Decode` if the bytes are malformed or belong to a
    /// different type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`. Behind the default `json` feature.
///
/// ```rust
/// use netbus_protocol::{Codec, JsonCodec};
///
/// #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
/// struct Chat { from: String, text: String }
///
/// let chat = Chat { from: "ada".into(), text: "hello".into() };
/// let bytes = JsonCodec.encode(&chat).unwrap();
/// let back: Chat = JsonCodec.decode(&bytes).unwrap();
/// assert_eq!(chat, back);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
