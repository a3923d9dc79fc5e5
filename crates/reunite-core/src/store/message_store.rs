use crate::models::{ConversationKey, Message};
use std::collections::{HashMap, HashSet};

/// Result of merging one message into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New message, placed in its conversation
    Inserted(ConversationKey),
    /// Already present; the stored copy only picked up a read flag it was missing
    ReadFlagRaised(ConversationKey),
    /// Already present and identical in every field the core tracks
    Duplicate,
    /// No thread reference, kept out of conversation views
    Unthreaded,
    /// Viewer is neither sender nor recipient
    Foreign,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted(_) | MergeOutcome::ReadFlagRaised(_)
        )
    }
}

/// Canonical message set for one viewer.
/// Messages are grouped by conversation and kept sorted by `(created_at, id)`.
pub struct MessageStore {
    viewer: String,
    messages_by_conversation: HashMap<ConversationKey, Vec<Message>>,
    /// id -> conversation, for dedup and read-flag lookups
    index: HashMap<String, ConversationKey>,
    unthreaded: HashSet<String>,
}

impl MessageStore {
    pub fn new(viewer: impl Into<String>) -> Self {
        Self {
            viewer: viewer.into(),
            messages_by_conversation: HashMap::new(),
            index: HashMap::new(),
            unthreaded: HashSet::new(),
        }
    }

    // ===== Getters =====

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id) || self.unthreaded.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        let key = self.index.get(id)?;
        self.messages_by_conversation
            .get(key)?
            .iter()
            .find(|m| m.id == id)
    }

    /// Messages of one conversation in chronological order.
    pub fn messages(&self, key: &ConversationKey) -> &[Message] {
        self.messages_by_conversation
            .get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConversationKey> {
        self.messages_by_conversation.keys()
    }

    /// Every conversation-addressable message, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages_by_conversation.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Most recent conversation on `thread_id`, if the viewer has any.
    pub fn latest_conversation_for_thread(&self, thread_id: &str) -> Option<&ConversationKey> {
        self.messages_by_conversation
            .iter()
            .filter(|(key, _)| key.thread_id == thread_id)
            .filter_map(|(key, msgs)| msgs.last().map(|m| (key, m.order_key())))
            .max_by(|a, b| a.1.cmp(&b.1))
            .map(|(key, _)| key)
    }

    // ===== Mutations =====

    /// Merge one message. Idempotent: a second merge of the same id never adds a copy.
    pub fn merge(&mut self, message: Message) -> MergeOutcome {
        if !message.involves(&self.viewer) {
            return MergeOutcome::Foreign;
        }
        let Some(key) = ConversationKey::for_message(&message, &self.viewer) else {
            self.unthreaded.insert(message.id);
            return MergeOutcome::Unthreaded;
        };

        if let Some(existing_key) = self.index.get(&message.id) {
            let existing_key = existing_key.clone();
            // is_read only ever moves false -> true
            if message.is_read {
                if let Some(stored) = self
                    .messages_by_conversation
                    .get_mut(&existing_key)
                    .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message.id))
                {
                    if !stored.is_read {
                        stored.is_read = true;
                        return MergeOutcome::ReadFlagRaised(existing_key);
                    }
                }
            }
            return MergeOutcome::Duplicate;
        }

        let messages = self.messages_by_conversation.entry(key.clone()).or_default();
        let insert_pos = messages.partition_point(|m| m.order_key() < message.order_key());
        self.index.insert(message.id.clone(), key.clone());
        messages.insert(insert_pos, message);
        MergeOutcome::Inserted(key)
    }

    /// Durably confirmed reads. Only messages addressed to the viewer are touched.
    /// Returns the ids whose flag actually changed.
    pub fn set_read(&mut self, ids: &[String]) -> Vec<String> {
        let mut changed = Vec::new();
        for id in ids {
            let Some(key) = self.index.get(id) else {
                continue;
            };
            let Some(stored) = self
                .messages_by_conversation
                .get_mut(key)
                .and_then(|msgs| msgs.iter_mut().find(|m| &m.id == id))
            else {
                continue;
            };
            if stored.recipient_id == self.viewer && !stored.is_read {
                stored.is_read = true;
                changed.push(id.clone());
            }
        }
        changed
    }
}
