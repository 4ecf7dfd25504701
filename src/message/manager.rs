//! Latest-value-per-key mailbox.
//!
//! Hands [`MessageContainer`]s from an I/O task to consumer threads without a
//! queue. Inserting under an existing key overwrites the previous value, so a
//! consumer slower than the producer only ever sees the newest message per
//! key. Consumers that must see every message should register a consumer
//! channel on the server instead.
//!
//! # Example
//!
//! ```
//! use igtlink_transport::message::{MessageContainer, MessageManager};
//!
//! let manager = MessageManager::new();
//! assert!(manager.get_first().is_none());
//!
//! manager.insert(5, MessageContainer::default());
//! assert!(manager.get(5).is_some());
//! assert!(manager.get(6).is_none());
//! ```

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::MessageContainer;

/// Thread-safe mailbox keyed by port number or channel id.
///
/// Every method takes the lock for one map operation and never calls out
/// while holding it. Reads return copies; the stored entry is never lent out.
#[derive(Debug, Default)]
pub struct MessageManager {
    slots: Mutex<BTreeMap<i32, MessageContainer>>,
}

impl MessageManager {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `container` under `key`, replacing any previous value.
    ///
    /// Returns the replaced container.
    pub fn insert(&self, key: i32, container: MessageContainer) -> Option<MessageContainer> {
        self.slots.lock().insert(key, container)
    }

    /// Copy of the latest container under `key`. The entry stays in place.
    pub fn get(&self, key: i32) -> Option<MessageContainer> {
        self.slots.lock().get(&key).cloned()
    }

    /// Copy of the entry with the smallest key.
    pub fn get_first(&self) -> Option<MessageContainer> {
        self.slots
            .lock()
            .first_key_value()
            .map(|(_, container)| container.clone())
    }

    /// Remove and return the entry under `key`.
    pub fn remove(&self, key: i32) -> Option<MessageContainer> {
        self.slots.lock().remove(&key)
    }

    /// Keys currently holding a value, ascending.
    pub fn keys(&self) -> Vec<i32> {
        self.slots.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
