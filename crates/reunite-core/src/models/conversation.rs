use serde::{Deserialize, Serialize};

use super::message::Message;

/// Identity of a conversation for one viewer: the listing plus the other participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub thread_id: String,
    pub counterpart_id: String,
}

impl ConversationKey {
    pub fn new(thread_id: impl Into<String>, counterpart_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            counterpart_id: counterpart_id.into(),
        }
    }

    /// Key of the conversation `message` belongs to, as seen by `viewer`.
    /// None when the message has no thread or the viewer is not a participant.
    pub fn for_message(message: &Message, viewer: &str) -> Option<Self> {
        let thread_id = message.thread_id.as_deref()?;
        let counterpart = message.counterpart_of(viewer)?;
        Some(Self::new(thread_id, counterpart))
    }
}

/// Derived view over a viewer's messages. Recomputed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub key: ConversationKey,
    pub last_message: Message,
    pub unread_count: usize,
    pub message_count: usize,
}

impl Conversation {
    pub fn thread_id(&self) -> &str {
        &self.key.thread_id
    }

    pub fn counterpart_id(&self) -> &str {
        &self.key.counterpart_id
    }

    pub fn has_unread(&self) -> bool {
        self.unread_count > 0
    }
}

/// Narrows the conversation list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationFilter {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl ConversationFilter {
    pub fn matches(&self, conversation: &Conversation) -> bool {
        if self.unread_only && !conversation.has_unread() {
            return false;
        }
        match &self.thread_id {
            Some(thread_id) => conversation.thread_id() == thread_id,
            None => true,
        }
    }
}
