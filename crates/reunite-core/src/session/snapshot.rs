use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::models::{ConversationKey, EnrichedMessage, MessageDraft};

/// One row of the conversation list, display fields already resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub counterpart_name: String,
    pub subject_title: String,
    pub preview: String,
    pub last_message_id: String,
    pub last_message_at: u64,
    pub unread_count: usize,
    pub message_count: usize,
    pub is_active: bool,
    pub has_pending_send: bool,
}

/// The conversation on screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveThread {
    pub thread_id: String,
    /// None until a counterpart is known (first message on a listing)
    pub counterpart_id: Option<String>,
    pub counterpart_name: Option<String>,
    pub subject_title: String,
    /// Chronological, pending sends last in their time slot
    pub messages: Vec<EnrichedMessage>,
}

/// A send the store rejected, kept so the user can retry or discard it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSend {
    pub correlation_id: String,
    pub key: ConversationKey,
    pub draft: MessageDraft,
    pub error: String,
    pub attempts: u32,
}

/// Immutable view of a session, republished after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub version: u64,
    pub viewer: String,
    pub conversations: Vec<ConversationSummary>,
    pub active: Option<ActiveThread>,
    /// Across all conversations, regardless of the list filter
    pub total_unread: usize,
    pub failed_sends: Vec<FailedSend>,
    /// False while the live feed is down and being re-opened
    pub live_connected: bool,
    /// No send, read write or display lookup is in flight
    pub is_settled: bool,
}

impl SessionSnapshot {
    pub fn conversation(&self, key: &ConversationKey) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| &c.key == key)
    }

    pub fn active_message_ids(&self) -> Vec<&str> {
        self.active
            .as_ref()
            .map(|a| a.messages.iter().map(|m| m.id()).collect())
            .unwrap_or_default()
    }
}

/// Publishes snapshots to any number of presentation-side subscribers.
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<SessionSnapshot>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(SessionSnapshot::default()));
        Self { tx }
    }

    pub fn publish(&self, snapshot: SessionSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn current(&self) -> Arc<SessionSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.tx.subscribe()
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}
