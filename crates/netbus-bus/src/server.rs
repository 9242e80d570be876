//! The message server: a bounded FIFO plus per-id receiver lists.
//!
//! Any thread may push. Exactly one thread (the application's main loop)
//! calls [`MessageServer::dispatch_messages`] once per tick, and that is the
//! only place receivers run. This is what keeps game logic single-threaded
//! even though messages arrive from the network thread.
//!
//! ```text
//! I/O thread ──push──┐
//!                    ▼
//! app thread ──push──► [ FIFO ] ──dispatch──► callback, receivers...
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use netbus_protocol::{Message, MessageId};
use serde::{Deserialize, Serialize};

use crate::BusError;

// ---------------------------------------------------------------------------
// BusConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`MessageServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of undispatched messages.
    pub capacity: usize,
}

impl BusConfig {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageServer
// ---------------------------------------------------------------------------

/// A receiver callback. Shared so the list can be cloned out of the lock
/// before anything runs.
pub type Receiver = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// The central publish/dispatch bus.
///
/// Share it with `Arc<MessageServer>`; every method takes `&self`.
pub struct MessageServer {
    queue: Mutex<VecDeque<Message>>,
    receivers: Mutex<HashMap<MessageId, Vec<Receiver>>>,
    capacity: usize,
}

impl MessageServer {
    pub fn new(config: BusConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            receivers: Mutex::new(HashMap::new()),
            capacity: config.capacity,
        }
    }

    /// Queues `message` for the next dispatch.
    ///
    /// # Errors
    /// [`BusError::Overflow`] when the FIFO is full. `message` is dropped.
    pub fn push_message(&self, message: Message) -> Result<(), BusError> {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            tracing::error!(
                capacity = self.capacity,
                id = message.id(),
                "message bus overflow"
            );
            return Err(BusError::Overflow {
                capacity: self.capacity,
            });
        }
        queue.push_back(message);
        Ok(())
    }

    /// Registers `receiver` for messages with `id`. Receivers for the same
    /// id run in registration order. There is no removal.
    pub fn add_message_receiver<F>(&self, id: MessageId, receiver: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.receivers)
            .entry(id)
            .or_default()
            .push(Arc::new(receiver));
    }

    /// Delivers every message that was queued when the call started.
    ///
    /// For each message, in push order: its callback runs, then each
    /// receiver for its id, then the message is dropped. Receivers may push
    /// more messages or register more receivers; new messages wait for the
    /// next call. Returns the number of messages dispatched.
    pub fn dispatch_messages(&self) -> usize {
        let batch = std::mem::take(&mut *lock(&self.queue));
        let count = batch.len();

        for mut message in batch {
            message.run_callback();

            // Cloned so receivers can call back into the bus without
            // deadlocking on the receivers lock.
            let receivers = lock(&self.receivers)
                .get(&message.id())
                .cloned()
                .unwrap_or_default();
            for receiver in &receivers {
                receiver(&message);
            }
        }

        if count > 0 {
            tracing::trace!(count, "dispatched messages");
        }
        count
    }

    /// Number of messages waiting for dispatch.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of receivers registered for `id`.
    pub fn receiver_count(&self, id: MessageId) -> usize {
        lock(&self.receivers).get(&id).map_or(0, Vec::len)
    }
}

impl Default for MessageServer {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for MessageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageServer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// A receiver that panicked mid-dispatch must not take the bus down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
