use crate::error::MessagingError;
use crate::models::{ConversationKey, Message};
use crate::store::MessageStore;
use std::collections::HashMap;

/// A set of message ids sent to the gateway in one read-flag update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub batch_id: u64,
    pub ids: Vec<String>,
    /// Conversation that triggered the batch, None for explicit mark-read calls
    pub conversation: Option<ConversationKey>,
}

/// Sub-store for read/unread accounting.
///
/// Canonical `is_read` flags live in `MessageStore` and only move once the gateway
/// confirms. Until then the ids of an in-flight batch form an optimistic overlay
/// that the aggregator treats as read. A failed batch simply drops its overlay,
/// so the messages show as unread again and the next view retries them.
pub struct UnreadLedger {
    /// message id -> batch currently writing it
    in_flight: HashMap<String, u64>,
    next_batch_id: u64,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            next_batch_id: 1,
        }
    }

    // ===== Getters =====

    /// Read as the viewer currently sees it, optimistic marks included.
    pub fn is_read(&self, message: &Message) -> bool {
        message.is_read || self.in_flight.contains_key(&message.id)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    // ===== Planning =====

    /// Unread messages addressed to the viewer in `key`, not already being written.
    pub fn plan_for_conversation(
        &mut self,
        store: &MessageStore,
        key: &ConversationKey,
    ) -> Option<ReadBatch> {
        let viewer = store.viewer();
        let ids: Vec<String> = store
            .messages(key)
            .iter()
            .filter(|m| m.is_addressed_to(viewer) && !self.is_read(m))
            .map(|m| m.id.clone())
            .collect();
        self.open_batch(ids, Some(key.clone()))
    }

    /// Explicit mark-read of specific ids.
    ///
    /// Unknown ids fail the whole call before anything is marked. Ids the viewer
    /// sent, and ids already read in the store, are skipped without error. Ids
    /// another batch is still writing are taken over by this one, so the caller's
    /// answer depends on its own write. Returns `Ok(None)` when nothing is left
    /// to write.
    pub fn plan_for_ids(
        &mut self,
        store: &MessageStore,
        ids: &[String],
    ) -> Result<Option<ReadBatch>, MessagingError> {
        let viewer = store.viewer();
        let mut to_write = Vec::new();
        for id in ids {
            let message = store
                .get(id)
                .ok_or_else(|| MessagingError::UnknownMessage(id.clone()))?;
            if !message.is_addressed_to(viewer) || message.is_read {
                continue;
            }
            if !to_write.contains(id) {
                to_write.push(id.clone());
            }
        }
        Ok(self.open_batch(to_write, None))
    }

    fn open_batch(
        &mut self,
        ids: Vec<String>,
        conversation: Option<ConversationKey>,
    ) -> Option<ReadBatch> {
        if ids.is_empty() {
            return None;
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        for id in &ids {
            self.in_flight.insert(id.clone(), batch_id);
        }
        Some(ReadBatch {
            batch_id,
            ids,
            conversation,
        })
    }

    // ===== Resolution =====

    /// Gateway answered the write: move the overlay into the canonical flags for
    /// the ids it confirmed. Unconfirmed ids show as unread again. Returns the
    /// batch ids the store did not confirm.
    pub fn commit(
        &mut self,
        store: &mut MessageStore,
        batch: &ReadBatch,
        confirmed: &[String],
    ) -> Vec<String> {
        self.release(batch);
        let (accepted, rejected): (Vec<String>, Vec<String>) = batch
            .ids
            .iter()
            .cloned()
            .partition(|id| confirmed.contains(id));
        store.set_read(&accepted);
        rejected
    }

    /// Gateway write failed: drop the overlay, messages show as unread again.
    pub fn rollback(&mut self, batch: &ReadBatch) {
        self.release(batch);
    }

    fn release(&mut self, batch: &ReadBatch) {
        for id in &batch.ids {
            if self.in_flight.get(id) == Some(&batch.batch_id) {
                self.in_flight.remove(id);
            }
        }
    }
}

impl Default for UnreadLedger {
    fn default() -> Self {
        Self::new()
    }
}
