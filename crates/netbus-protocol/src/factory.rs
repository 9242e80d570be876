//! Rebuilding messages that arrive from the wire or out of an envelope.

use std::collections::HashSet;

use crate::{
    AcceptedMessage, ConnectedMessage, ConnectionFailedMessage, DisconnectedMessage, Message,
    MessageId, NetMessage, Packet, RejectedMessage, TypedMessage, ValidateMessage,
};

/// Turns an id and raw body bytes back into a [`Message`].
///
/// Returning `None` drops the input. The transport logs the drop and keeps
/// the connection up, so a factory is the place to refuse message types a
/// process doesn't understand.
pub trait MessageFactory: Send + Sync + 'static {
    fn create(&self, id: MessageId, payload: Vec<u8>) -> Option<Message>;
}

/// Accepts every id.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughFactory;

impl MessageFactory for PassthroughFactory {
    fn create(&self, id: MessageId, payload: Vec<u8>) -> Option<Message> {
        Some(Message::with_packet(id, Packet::from_bytes(payload)))
    }
}

/// Accepts only ids that were registered up front.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    known: HashSet<MessageId>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows the envelope and the handshake
    /// messages.
    pub fn with_lifecycle() -> Self {
        let mut registry = Self::new();
        registry
            .register::<NetMessage>()
            .register::<ConnectedMessage>()
            .register::<ValidateMessage>()
            .register::<AcceptedMessage>()
            .register::<RejectedMessage>()
            .register::<DisconnectedMessage>()
            .register::<ConnectionFailedMessage>();
        registry
    }

    pub fn register<T: TypedMessage>(&mut self) -> &mut Self {
        self.register_id(T::ID)
    }

    pub fn register_id(&mut self, id: MessageId) -> &mut Self {
        self.known.insert(id);
        self
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.known.contains(&id)
    }
}

impl MessageFactory for MessageRegistry {
    fn create(&self, id: MessageId, payload: Vec<u8>) -> Option<Message> {
        if !self.contains(id) {
            tracing::debug!(id, "unregistered message id");
            return None;
        }
        Some(Message::with_packet(id, Packet::from_bytes(payload)))
    }
}
