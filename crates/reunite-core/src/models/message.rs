use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// A coordinate pair attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Photo,
    Location,
}

impl MessageKind {
    /// Derive the kind from the populated payload fields.
    /// A photo wins over a location, a location wins over plain text.
    pub fn from_payload(photo_ref: Option<&str>, location: Option<&Location>) -> Self {
        if photo_ref.is_some_and(|p| !p.trim().is_empty()) {
            MessageKind::Photo
        } else if location.is_some() {
            MessageKind::Location
        } else {
            MessageKind::Text
        }
    }
}

/// A stored message. Everything except `is_read` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Listing the conversation is about. Messages without one never show up
    /// in conversation views.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
    pub kind: MessageKind,
    /// Unix milliseconds
    pub created_at: u64,
    #[serde(default)]
    pub is_read: bool,
    /// Correlation reference set by the sending client, echoed back by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Message {
    /// Total order inside a thread: creation time, then id for same-millisecond sends.
    pub fn order_key(&self) -> (u64, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.recipient_id == user_id
    }

    /// The other participant, relative to `viewer`. None if the viewer is not a participant.
    pub fn counterpart_of(&self, viewer: &str) -> Option<&str> {
        if self.sender_id == viewer {
            Some(&self.recipient_id)
        } else if self.recipient_id == viewer {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    pub fn is_addressed_to(&self, viewer: &str) -> bool {
        self.recipient_id == viewer
    }

    /// Short single-line preview used by conversation lists.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.content.trim();
        if !text.is_empty() {
            let first_line = text.lines().next().unwrap_or_default();
            let mut preview: String = first_line.chars().take(max_chars).collect();
            if first_line.chars().count() > max_chars || text.lines().nth(1).is_some() {
                preview.push('…');
            }
            return preview;
        }
        match self.kind {
            MessageKind::Photo => "[photo]".to_string(),
            MessageKind::Location => "[location]".to_string(),
            MessageKind::Text => String::new(),
        }
    }
}

/// What the user typed: at least one of the three fields must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn photo(photo_ref: impl Into<String>) -> Self {
        Self {
            photo_ref: Some(photo_ref.into()),
            ..Default::default()
        }
    }

    pub fn location(latitude: f64, longitude: f64) -> Self {
        Self {
            location: Some(Location {
                latitude,
                longitude,
            }),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
            && self
                .photo_ref
                .as_deref()
                .map(|p| p.trim().is_empty())
                .unwrap_or(true)
            && self.location.is_none()
    }

    /// Reject empty drafts, otherwise return the kind the stored message will carry.
    pub fn validate(&self) -> Result<MessageKind, MessagingError> {
        if self.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }
        Ok(MessageKind::from_payload(
            self.photo_ref.as_deref(),
            self.location.as_ref(),
        ))
    }
}

/// Insert payload handed to the gateway. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub thread_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub photo_ref: Option<String>,
    pub location: Option<Location>,
    pub kind: MessageKind,
    pub client_ref: String,
}

impl NewMessage {
    pub fn from_draft(
        thread_id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        draft: &MessageDraft,
        client_ref: impl Into<String>,
    ) -> Result<Self, MessagingError> {
        let kind = draft.validate()?;
        Ok(Self {
            thread_id: thread_id.into(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: draft.content.trim().to_string(),
            photo_ref: draft.photo_ref.clone().filter(|p| !p.trim().is_empty()),
            location: draft.location,
            kind,
            client_ref: client_ref.into(),
        })
    }

    /// Build the local stand-in shown while the insert is in flight.
    pub fn provisional(&self, id: impl Into<String>, created_at: u64) -> Message {
        Message {
            id: id.into(),
            thread_id: Some(self.thread_id.clone()),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            content: self.content.clone(),
            photo_ref: self.photo_ref.clone(),
            location: self.location,
            kind: self.kind,
            created_at,
            is_read: false,
            client_ref: Some(self.client_ref.clone()),
        }
    }
}
