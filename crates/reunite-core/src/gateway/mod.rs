//! Contracts of the external collaborators: the durable message store with its
//! insert feed, and the directory that resolves display names, listing titles and
//! listing contacts. Any transport works as long as insert delivery is at-least-once.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::GatewayResult;
use crate::models::{Message, NewMessage};

pub use memory::{InMemoryDirectory, InMemoryGateway};

/// Live feed of inserted messages.
///
/// A transport that can no longer guarantee delivery (dropped connection, a
/// subscriber that fell behind) yields `Err(GatewayError::SubscriptionClosed)` and
/// then ends. The subscriber re-subscribes and queries to catch up.
pub type MessageStream = BoxStream<'static, GatewayResult<Message>>;

/// Query scope: every message where `participant` is sender or recipient,
/// optionally narrowed to one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    pub participant: String,
    pub thread_id: Option<String>,
}

impl MessageFilter {
    pub fn participant(participant: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            thread_id: None,
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.involves(&self.participant)
            && self
                .thread_id
                .as_deref()
                .map_or(true, |t| message.thread_id.as_deref() == Some(t))
    }
}

/// Insert-feed filter. A session opens one of each for its viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertFilter {
    Sender(String),
    Recipient(String),
}

impl InsertFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            InsertFilter::Sender(id) => &message.sender_id == id,
            InsertFilter::Recipient(id) => &message.recipient_id == id,
        }
    }
}

/// Durable message store.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Atomic create. The returned message carries the store-assigned id and timestamp.
    async fn insert_message(&self, payload: NewMessage) -> GatewayResult<Message>;

    async fn query_messages(&self, filter: MessageFilter) -> GatewayResult<Vec<Message>>;

    /// Conditional update: only messages whose recipient is `recipient_id` are
    /// touched. Returns the requested ids that are read for that recipient after
    /// the call, whether this call changed them or they already were. Ids left
    /// out were not found or are addressed to someone else.
    async fn update_read_flag(
        &self,
        ids: Vec<String>,
        recipient_id: String,
    ) -> GatewayResult<Vec<String>>;

    async fn subscribe_to_inserts(&self, filter: InsertFilter) -> GatewayResult<MessageStream>;
}

/// Best-effort display lookups.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_display_identity(&self, user_id: &str) -> GatewayResult<String>;

    async fn resolve_subject_title(&self, thread_id: &str) -> GatewayResult<String>;

    /// Registered contact of a listing, the recipient of a first message on it.
    async fn resolve_subject_contact(&self, thread_id: &str) -> GatewayResult<String>;
}
