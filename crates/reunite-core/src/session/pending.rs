use serde::Serialize;

use crate::constants::PENDING_ID_PREFIX;
use crate::models::{ConversationKey, Message, MessageDraft, NewMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum PendingStatus {
    InFlight,
    Failed { error: String },
}

/// A send the store has not confirmed yet, keyed by its client correlation reference.
/// Lives independently of which conversation is on screen.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub correlation_id: String,
    pub key: ConversationKey,
    pub draft: MessageDraft,
    pub payload: NewMessage,
    /// Local stand-in rendered while in flight
    pub provisional: Message,
    pub status: PendingStatus,
    pub attempts: u32,
}

impl PendingSend {
    pub fn is_in_flight(&self) -> bool {
        self.status == PendingStatus::InFlight
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            PendingStatus::Failed { error } => Some(error),
            PendingStatus::InFlight => None,
        }
    }
}

pub fn provisional_id(correlation_id: &str) -> String {
    format!("{}{}", PENDING_ID_PREFIX, correlation_id)
}

/// Sub-store for optimistic sends.
pub struct PendingSends {
    sends: Vec<PendingSend>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self { sends: Vec::new() }
    }

    // ===== Getters =====

    pub fn get(&self, correlation_id: &str) -> Option<&PendingSend> {
        self.sends.iter().find(|p| p.correlation_id == correlation_id)
    }

    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    /// Provisional messages of sends still in flight, for every conversation.
    pub fn in_flight_messages(&self) -> impl Iterator<Item = &Message> {
        self.sends
            .iter()
            .filter(|p| p.is_in_flight())
            .map(|p| &p.provisional)
    }

    pub fn in_flight_for<'a>(
        &'a self,
        key: &'a ConversationKey,
    ) -> impl Iterator<Item = &'a PendingSend> + 'a {
        self.sends
            .iter()
            .filter(move |p| p.is_in_flight() && &p.key == key)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PendingSend> {
        self.sends.iter().filter(|p| !p.is_in_flight())
    }

    // ===== Mutations =====

    pub fn stage(
        &mut self,
        key: ConversationKey,
        draft: MessageDraft,
        payload: NewMessage,
        created_at: u64,
    ) -> &PendingSend {
        let correlation_id = payload.client_ref.clone();
        let provisional = payload.provisional(provisional_id(&correlation_id), created_at);
        self.sends.push(PendingSend {
            correlation_id,
            key,
            draft,
            payload,
            provisional,
            status: PendingStatus::InFlight,
            attempts: 1,
        });
        &self.sends[self.sends.len() - 1]
    }

    /// Remove and return the send, whatever its status.
    pub fn take(&mut self, correlation_id: &str) -> Option<PendingSend> {
        let pos = self
            .sends
            .iter()
            .position(|p| p.correlation_id == correlation_id)?;
        Some(self.sends.remove(pos))
    }

    pub fn fail(&mut self, correlation_id: &str, error: impl Into<String>) -> bool {
        match self
            .sends
            .iter_mut()
            .find(|p| p.correlation_id == correlation_id && p.is_in_flight())
        {
            Some(pending) => {
                pending.status = PendingStatus::Failed {
                    error: error.into(),
                };
                true
            }
            None => false,
        }
    }

    /// Put a failed send back in flight under the same correlation reference.
    pub fn retry(&mut self, correlation_id: &str, created_at: u64) -> Option<NewMessage> {
        let pending = self
            .sends
            .iter_mut()
            .find(|p| p.correlation_id == correlation_id && !p.is_in_flight())?;
        pending.status = PendingStatus::InFlight;
        pending.attempts += 1;
        pending.provisional.created_at = created_at;
        Some(pending.payload.clone())
    }
}

impl Default for PendingSends {
    fn default() -> Self {
        Self::new()
    }
}
