use serde::{Deserialize, Serialize};

use super::message::Message;

/// Where a message shown in the active thread stands relative to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// Authoritative copy from the store
    Stored,
    /// Optimistic copy, insert still in flight
    Pending,
}

/// Display decorator over a canonical message. The wrapped record is never mutated
/// by enrichment; names and titles live alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMessage {
    pub message: Message,
    pub sender_name: String,
    pub subject_title: String,
    pub delivery: DeliveryState,
    /// Read as the viewer sees it, optimistic marks included
    pub is_read: bool,
}

impl EnrichedMessage {
    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}
