//! Per-session conversation state machine.
//!
//! Owns the canonical message set, the read overlay, display lookups and the
//! optimistic sends of one viewer. Every mutation republishes an immutable
//! `SessionSnapshot`. No I/O happens here: the runtime performs gateway calls and
//! feeds their results back through the `confirm_*` / `apply_*` methods.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::MessagingConfig;
use crate::error::{GatewayError, MessagingError};
use crate::models::{
    ConversationFilter, ConversationKey, DeliveryState, EnrichedMessage, Message, MessageDraft,
    NewMessage,
};
use crate::session::pending::PendingSends;
use crate::session::snapshot::{
    ActiveThread, ConversationSummary, FailedSend, SessionSnapshot, SnapshotPublisher,
};
use crate::store::{
    aggregate_conversations, total_unread, EnrichmentCache, EnrichmentRequest, MergeOutcome,
    MessageStore, ReadBatch, UnreadLedger,
};

/// Which conversation is on screen. The counterpart is unknown when the viewer
/// opens a listing they have never written about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub thread_id: String,
    pub counterpart_id: Option<String>,
}

/// Where a send should go, decided before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Known {
        thread_id: String,
        recipient_id: String,
    },
    /// First message on a listing: its registered contact must be resolved first
    NeedsContact { thread_id: String },
}

pub struct ConversationController {
    viewer: String,
    preview_chars: usize,
    store: MessageStore,
    unread: UnreadLedger,
    enrichment: EnrichmentCache,
    pending: PendingSends,
    selection: Option<Selection>,
    filter: ConversationFilter,
    enrichment_queue: Vec<EnrichmentRequest>,
    live_connected: bool,
    version: u64,
    publisher: SnapshotPublisher,
}

impl ConversationController {
    pub fn new(viewer: impl Into<String>, config: &MessagingConfig) -> Self {
        let viewer = viewer.into();
        Self {
            store: MessageStore::new(viewer.clone()),
            viewer,
            preview_chars: config.preview_chars,
            unread: UnreadLedger::new(),
            enrichment: EnrichmentCache::new(
                config.unknown_user_label.clone(),
                config.missing_subject_label.clone(),
                config.enrichment_max_attempts,
            ),
            pending: PendingSends::new(),
            selection: None,
            filter: ConversationFilter::default(),
            enrichment_queue: Vec::new(),
            live_connected: false,
            version: 0,
            publisher: SnapshotPublisher::new(),
        }
    }

    // ===== Getters =====

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn pending(&self) -> &PendingSends {
        &self.pending
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn active_key(&self) -> Option<ConversationKey> {
        let selection = self.selection.as_ref()?;
        let counterpart = selection.counterpart_id.as_ref()?;
        Some(ConversationKey::new(
            selection.thread_id.clone(),
            counterpart.clone(),
        ))
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn current_snapshot(&self) -> Arc<SessionSnapshot> {
        self.publisher.current()
    }

    // ===== Loading and reconciliation =====

    /// Initial snapshot from the store. Returns how many messages were new.
    pub fn load_initial(&mut self, messages: Vec<Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if matches!(self.absorb(message), MergeOutcome::Inserted(_)) {
                inserted += 1;
            }
        }
        self.publish();
        inserted
    }

    /// Merge one message from the live feed.
    ///
    /// Duplicates (initial load racing the feed, both subscriptions firing for a
    /// self-message, at-least-once redelivery) are dropped. A message carrying the
    /// correlation reference of one of our pending sends settles that send.
    pub fn merge_live(&mut self, message: Message) -> MergeOutcome {
        let settled = message
            .client_ref
            .as_deref()
            .and_then(|client_ref| self.pending.take(client_ref))
            .is_some();
        if settled {
            tracing::debug!(id = %message.id, "pending send settled by live feed");
        }

        let id = message.id.clone();
        let outcome = self.absorb(message);
        match &outcome {
            MergeOutcome::Duplicate => tracing::debug!(%id, "duplicate delivery dropped"),
            MergeOutcome::Foreign => tracing::warn!(%id, "live message for another user ignored"),
            MergeOutcome::Inserted(key) => self.bind_counterpart(key),
            _ => {}
        }

        if outcome.changed() || settled {
            self.publish();
        }
        outcome
    }

    /// Catch-up after the live feed was re-opened. Returns the conversations of
    /// the messages missed while it was down.
    pub fn merge_catch_up(&mut self, messages: Vec<Message>) -> Vec<ConversationKey> {
        let mut inserted = Vec::new();
        for message in messages {
            if let MergeOutcome::Inserted(key) = self.absorb(message) {
                self.bind_counterpart(&key);
                inserted.push(key);
            }
        }
        if !inserted.is_empty() {
            self.publish();
        }
        inserted
    }

    /// A listing opened before anyone wrote about it gets its counterpart from the
    /// first conversation that appears on it.
    fn bind_counterpart(&mut self, key: &ConversationKey) {
        let Some(selection) = self.selection.as_mut() else {
            return;
        };
        if selection.thread_id != key.thread_id || selection.counterpart_id.is_some() {
            return;
        }
        tracing::debug!(
            thread = %key.thread_id,
            counterpart = %key.counterpart_id,
            "conversation bound to selection"
        );
        selection.counterpart_id = Some(key.counterpart_id.clone());
    }

    pub fn set_live_connected(&mut self, connected: bool) {
        if self.live_connected != connected {
            self.live_connected = connected;
            self.publish();
        }
    }

    fn absorb(&mut self, message: Message) -> MergeOutcome {
        let outcome = self.store.merge(message.clone());
        if matches!(outcome, MergeOutcome::Inserted(_)) {
            let requests = self.enrichment.requests_for(&message);
            self.enrichment_queue.extend(requests);
        }
        outcome
    }

    // ===== Selection and read accounting =====

    /// Put a conversation on screen and publish it. Read marking is a separate,
    /// later step (`mark_active_read`) so the first render still shows the badge.
    ///
    /// Without an explicit counterpart the most recent conversation on the listing
    /// is picked, or none if the viewer never wrote about it.
    pub fn select_conversation(&mut self, thread_id: impl Into<String>, counterpart_id: Option<String>) {
        let thread_id = thread_id.into();
        let counterpart_id = counterpart_id.or_else(|| {
            self.store
                .latest_conversation_for_thread(&thread_id)
                .map(|key| key.counterpart_id.clone())
        });

        self.queue_lookup(EnrichmentRequest::SubjectTitle {
            thread_id: thread_id.clone(),
        });
        if let Some(counterpart) = &counterpart_id {
            self.queue_lookup(EnrichmentRequest::DisplayName {
                user_id: counterpart.clone(),
            });
        }

        self.selection = Some(Selection {
            thread_id,
            counterpart_id,
        });
        self.publish();
    }

    pub fn clear_selection(&mut self) {
        if self.selection.take().is_some() {
            self.publish();
        }
    }

    /// Optimistically mark the active conversation's unread messages and return
    /// the batch to write, if any.
    pub fn mark_active_read(&mut self) -> Option<ReadBatch> {
        let key = self.active_key()?;
        let batch = self.unread.plan_for_conversation(&self.store, &key)?;
        self.publish();
        Some(batch)
    }

    /// Explicit mark-read. Unknown ids are an error; the viewer's own messages and
    /// already-read ones are skipped.
    pub fn mark_read(&mut self, ids: &[String]) -> Result<Option<ReadBatch>, MessagingError> {
        let batch = self.unread.plan_for_ids(&self.store, ids)?;
        if batch.is_some() {
            self.publish();
        }
        Ok(batch)
    }

    pub fn apply_read_result(
        &mut self,
        batch: &ReadBatch,
        result: Result<Vec<String>, GatewayError>,
    ) -> Result<(), MessagingError> {
        match result {
            Ok(confirmed) => {
                let rejected = self.unread.commit(&mut self.store, batch, &confirmed);
                self.publish();
                if rejected.is_empty() {
                    tracing::debug!(
                        batch = batch.batch_id,
                        ids = batch.ids.len(),
                        "read flags confirmed"
                    );
                    Ok(())
                } else {
                    tracing::warn!(batch = batch.batch_id, ?rejected, "store left messages unread");
                    Err(MessagingError::ReadRejected { ids: rejected })
                }
            }
            Err(e) => {
                tracing::warn!(batch = batch.batch_id, "read flag update failed: {}", e);
                self.unread.rollback(batch);
                self.publish();
                Err(e.into())
            }
        }
    }

    // ===== Sending =====

    /// Validate a draft and decide its recipient. Empty drafts are rejected here,
    /// before the runtime touches the gateway.
    pub fn prepare_send(&self, draft: &MessageDraft) -> Result<SendTarget, MessagingError> {
        draft.validate()?;
        let selection = self
            .selection
            .as_ref()
            .ok_or(MessagingError::NoActiveConversation)?;
        // a conversation may have appeared since the listing was opened
        let counterpart = selection.counterpart_id.clone().or_else(|| {
            self.store
                .latest_conversation_for_thread(&selection.thread_id)
                .map(|key| key.counterpart_id.clone())
        });
        Ok(match counterpart {
            Some(recipient_id) => SendTarget::Known {
                thread_id: selection.thread_id.clone(),
                recipient_id,
            },
            None => SendTarget::NeedsContact {
                thread_id: selection.thread_id.clone(),
            },
        })
    }

    /// Append the optimistic copy and return the insert payload. Its `client_ref`
    /// is the correlation reference used to settle the send later.
    pub fn stage_send(
        &mut self,
        thread_id: &str,
        recipient_id: &str,
        draft: MessageDraft,
    ) -> Result<NewMessage, MessagingError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let payload =
            NewMessage::from_draft(thread_id, &self.viewer, recipient_id, &draft, correlation_id)?;
        let key = ConversationKey::new(thread_id, recipient_id);

        if let Some(selection) = self.selection.as_mut() {
            if selection.thread_id == thread_id && selection.counterpart_id.is_none() {
                selection.counterpart_id = Some(recipient_id.to_string());
            }
        }
        self.queue_lookup(EnrichmentRequest::DisplayName {
            user_id: recipient_id.to_string(),
        });

        let created_at = self.next_local_timestamp(&key);
        self.pending.stage(key, draft, payload.clone(), created_at);
        self.publish();
        Ok(payload)
    }

    /// Settle a send with the store's answer. Works whether or not the
    /// conversation is still on screen.
    pub fn confirm_send(
        &mut self,
        correlation_id: &str,
        result: Result<Message, GatewayError>,
    ) -> Result<Message, MessagingError> {
        match result {
            Ok(message) => {
                self.pending.take(correlation_id);
                self.absorb(message.clone());
                self.publish();
                Ok(message)
            }
            Err(e) => {
                tracing::warn!(correlation = correlation_id, "send failed: {}", e);
                if self.pending.fail(correlation_id, e.to_string()) {
                    self.publish();
                }
                Err(e.into())
            }
        }
    }

    /// Put a failed send back in flight. Returns the payload to insert again.
    pub fn retry_send(&mut self, correlation_id: &str) -> Result<NewMessage, MessagingError> {
        let key = self
            .pending
            .get(correlation_id)
            .filter(|p| !p.is_in_flight())
            .map(|p| p.key.clone())
            .ok_or_else(|| MessagingError::UnknownSend(correlation_id.to_string()))?;
        let created_at = self.next_local_timestamp(&key);
        let payload = self
            .pending
            .retry(correlation_id, created_at)
            .ok_or_else(|| MessagingError::UnknownSend(correlation_id.to_string()))?;
        self.publish();
        Ok(payload)
    }

    pub fn discard_failed_send(&mut self, correlation_id: &str) -> Result<(), MessagingError> {
        let failed = self
            .pending
            .get(correlation_id)
            .is_some_and(|p| !p.is_in_flight());
        if !failed {
            return Err(MessagingError::UnknownSend(correlation_id.to_string()));
        }
        self.pending.take(correlation_id);
        self.publish();
        Ok(())
    }

    /// Local timestamp for an optimistic copy: now, but never before the newest
    /// message already shown in that conversation.
    fn next_local_timestamp(&self, key: &ConversationKey) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let newest_stored = self.store.messages(key).last().map(|m| m.created_at);
        let newest_pending = self
            .pending
            .in_flight_for(key)
            .map(|p| p.provisional.created_at)
            .max();
        let floor = newest_stored
            .into_iter()
            .chain(newest_pending)
            .max()
            .map(|t| t + 1)
            .unwrap_or(0);
        now.max(floor)
    }

    // ===== Enrichment =====

    fn queue_lookup(&mut self, request: EnrichmentRequest) {
        if self.enrichment.begin(&request) {
            self.enrichment_queue.push(request);
        }
    }

    /// Lookups queued since the last call, for the runtime to dispatch.
    pub fn take_enrichment_requests(&mut self) -> Vec<EnrichmentRequest> {
        std::mem::take(&mut self.enrichment_queue)
    }

    pub fn due_enrichment_retries(&mut self) -> Vec<EnrichmentRequest> {
        self.enrichment.due_retries()
    }

    pub fn apply_enrichment(
        &mut self,
        request: &EnrichmentRequest,
        result: Result<String, GatewayError>,
    ) {
        if self.enrichment.resolve(request, result) {
            self.publish();
        }
    }

    // ===== Snapshots =====

    pub fn set_filter(&mut self, filter: ConversationFilter) {
        if self.filter != filter {
            self.filter = filter;
            self.publish();
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = self.build_snapshot();
        self.publisher.publish(snapshot);
    }

    /// Recompute everything from the canonical set plus in-flight sends.
    pub fn build_snapshot(&self) -> SessionSnapshot {
        let unread = &self.unread;
        let visible = self.store.iter().chain(self.pending.in_flight_messages());
        let conversations = aggregate_conversations(visible, &self.viewer, |m| unread.is_read(m));
        let active_key = self.active_key();

        let summaries = conversations
            .iter()
            .filter(|c| self.filter.matches(c))
            .map(|c| ConversationSummary {
                key: c.key.clone(),
                counterpart_name: self.enrichment.display_name(c.counterpart_id()),
                subject_title: self.enrichment.subject_title(c.thread_id()),
                preview: c.last_message.preview(self.preview_chars),
                last_message_id: c.last_message.id.clone(),
                last_message_at: c.last_message.created_at,
                unread_count: c.unread_count,
                message_count: c.message_count,
                is_active: active_key.as_ref() == Some(&c.key),
                has_pending_send: self.pending.in_flight_for(&c.key).next().is_some(),
            })
            .collect();

        let failed_sends = self
            .pending
            .failed()
            .map(|p| FailedSend {
                correlation_id: p.correlation_id.clone(),
                key: p.key.clone(),
                draft: p.draft.clone(),
                error: p.error().unwrap_or_default().to_string(),
                attempts: p.attempts,
            })
            .collect();

        SessionSnapshot {
            version: self.version,
            viewer: self.viewer.clone(),
            conversations: summaries,
            active: self.selection.as_ref().map(|s| self.build_active(s)),
            total_unread: total_unread(&conversations),
            failed_sends,
            live_connected: self.live_connected,
            is_settled: self.pending.in_flight_messages().next().is_none()
                && self.unread.in_flight_count() == 0
                && self.enrichment.in_flight_count() == 0,
        }
    }

    fn build_active(&self, selection: &Selection) -> ActiveThread {
        let subject_title = self.enrichment.subject_title(&selection.thread_id);
        let mut messages: Vec<EnrichedMessage> = Vec::new();

        if let Some(counterpart) = &selection.counterpart_id {
            let key = ConversationKey::new(selection.thread_id.clone(), counterpart.clone());
            let stored = self
                .store
                .messages(&key)
                .iter()
                .map(|m| (m, DeliveryState::Stored));
            let pending = self
                .pending
                .in_flight_for(&key)
                .map(|p| (&p.provisional, DeliveryState::Pending));
            messages = stored
                .chain(pending)
                .map(|(m, delivery)| EnrichedMessage {
                    message: m.clone(),
                    sender_name: self.enrichment.display_name(&m.sender_id),
                    subject_title: subject_title.clone(),
                    delivery,
                    is_read: self.unread.is_read(m),
                })
                .collect();
            messages.sort_by(|a, b| a.message.order_key().cmp(&b.message.order_key()));
        }

        ActiveThread {
            thread_id: selection.thread_id.clone(),
            counterpart_name: selection
                .counterpart_id
                .as_deref()
                .map(|c| self.enrichment.display_name(c)),
            counterpart_id: selection.counterpart_id.clone(),
            subject_title,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    fn msg(id: &str, thread: &str, from: &str, to: &str, at: u64) -> Message {
        Message {
            id: id.to_string(),
            thread_id: Some(thread.to_string()),
            sender_id: from.to_string(),
            recipient_id: to.to_string(),
            content: format!("message {}", id),
            photo_ref: None,
            location: None,
            kind: MessageKind::Text,
            created_at: at,
            is_read: false,
            client_ref: None,
        }
    }

    /// V talks to C about L1 (one sent, one received) and hears from D about L2.
    fn controller() -> ConversationController {
        let mut controller = ConversationController::new("V", &MessagingConfig::default());
        controller.load_initial(vec![
            msg("1", "L1", "V", "C", 100),
            msg("2", "L1", "C", "V", 200),
            msg("3", "L2", "D", "V", 150),
        ]);
        controller
    }

    fn l1() -> ConversationKey {
        ConversationKey::new("L1", "C")
    }

    fn unread(controller: &ConversationController, key: &ConversationKey) -> usize {
        controller
            .current_snapshot()
            .conversation(key)
            .map(|c| c.unread_count)
            .unwrap_or_default()
    }

    #[test]
    fn test_initial_aggregation() {
        let controller = controller();
        let snapshot = controller.current_snapshot();
        assert_eq!(snapshot.conversations.len(), 2);
        assert_eq!(snapshot.total_unread, 2);

        let l1 = snapshot.conversation(&l1()).unwrap();
        assert_eq!(l1.unread_count, 1);
        assert_eq!(l1.last_message_id, "2");
        assert_eq!(l1.counterpart_name, "Unknown user");
        assert_eq!(l1.subject_title, "Listing unavailable");
    }

    #[test]
    fn test_select_renders_before_marking() {
        let mut controller = controller();
        controller.select_conversation("L1", None);

        let rendered = controller.current_snapshot();
        assert_eq!(rendered.active.as_ref().unwrap().counterpart_id.as_deref(), Some("C"));
        assert_eq!(rendered.active_message_ids(), vec!["1", "2"]);
        assert_eq!(unread(&controller, &l1()), 1);

        let batch = controller.mark_active_read().unwrap();
        assert_eq!(batch.ids, vec!["2".to_string()]);
        assert!(controller.current_snapshot().version > rendered.version);
        assert_eq!(unread(&controller, &l1()), 0);
    }

    #[test]
    fn test_mark_read_confirmed_then_repeated() {
        let mut controller = controller();
        let batch = controller.mark_read(&["2".to_string()]).unwrap().unwrap();
        controller
            .apply_read_result(&batch, Ok(vec!["2".to_string()]))
            .unwrap();
        assert_eq!(unread(&controller, &l1()), 0);
        assert!(controller.store().get("2").unwrap().is_read);

        assert!(controller.mark_read(&["2".to_string()]).unwrap().is_none());
        assert_eq!(unread(&controller, &l1()), 0);
    }

    #[test]
    fn test_failed_read_write_leaves_unread() {
        let mut controller = controller();
        controller.select_conversation("L1", Some("C".to_string()));
        let batch = controller.mark_active_read().unwrap();
        assert_eq!(unread(&controller, &l1()), 0);

        let err = controller
            .apply_read_result(&batch, Err(GatewayError::Unavailable("down".into())))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(unread(&controller, &l1()), 1);
        assert!(!controller.store().get("2").unwrap().is_read);

        // viewing again retries
        assert!(controller.mark_active_read().is_some());
    }

    #[test]
    fn test_live_duplicate_leaves_state_unchanged() {
        let mut controller = controller();
        let before = controller.current_snapshot();

        let outcome = controller.merge_live(msg("1", "L1", "V", "C", 100));
        assert_eq!(outcome, MergeOutcome::Duplicate);

        let after = controller.current_snapshot();
        assert_eq!(after.version, before.version);
        let l1 = after.conversation(&l1()).unwrap();
        assert_eq!(l1.message_count, 2);
        assert_eq!(l1.last_message_id, "2");
    }

    #[test]
    fn test_live_message_moves_conversation_to_top() {
        let mut controller = controller();
        let outcome = controller.merge_live(msg("4", "L2", "D", "V", 300));
        assert_eq!(outcome, MergeOutcome::Inserted(ConversationKey::new("L2", "D")));

        let snapshot = controller.current_snapshot();
        assert_eq!(snapshot.conversations[0].key, ConversationKey::new("L2", "D"));
        assert_eq!(snapshot.conversations[0].unread_count, 2);
        assert_eq!(snapshot.total_unread, 3);
    }

    #[test]
    fn test_older_live_message_does_not_replace_last() {
        let mut controller = controller();
        controller.merge_live(msg("0", "L1", "C", "V", 50));
        let l1 = controller.current_snapshot().conversation(&l1()).cloned().unwrap();
        assert_eq!(l1.last_message_id, "2");
        assert_eq!(l1.message_count, 3);
    }

    #[test]
    fn test_empty_send_rejected_without_state_change() {
        let mut controller = controller();
        controller.select_conversation("L1", None);
        let version = controller.current_snapshot().version;

        let err = controller.prepare_send(&MessageDraft::default()).unwrap_err();
        assert_eq!(err, MessagingError::EmptyMessage);
        assert_eq!(controller.current_snapshot().version, version);
        assert!(controller.pending().is_empty());
    }

    #[test]
    fn test_send_needs_selection() {
        let controller = controller();
        assert_eq!(
            controller.prepare_send(&MessageDraft::text("hi")).unwrap_err(),
            MessagingError::NoActiveConversation
        );
    }

    #[test]
    fn test_send_target_for_new_listing_needs_contact() {
        let mut controller = controller();
        controller.select_conversation("L3", None);
        assert_eq!(
            controller.prepare_send(&MessageDraft::text("I found your keys")).unwrap(),
            SendTarget::NeedsContact {
                thread_id: "L3".to_string()
            }
        );

        controller
            .stage_send("L3", "owner", MessageDraft::text("I found your keys"))
            .unwrap();
        // later sends reuse the counterpart
        assert_eq!(
            controller.prepare_send(&MessageDraft::text("still there?")).unwrap(),
            SendTarget::Known {
                thread_id: "L3".to_string(),
                recipient_id: "owner".to_string()
            }
        );
    }

    #[test]
    fn test_optimistic_send_then_failure_rolls_back() {
        let mut controller = controller();
        controller.select_conversation("L2", None);
        let before = controller
            .current_snapshot()
            .conversation(&ConversationKey::new("L2", "D"))
            .cloned()
            .unwrap();

        let payload = controller
            .stage_send("L2", "D", MessageDraft::text("Is the cat still missing?"))
            .unwrap();
        let optimistic = controller.current_snapshot();
        let l2 = optimistic
            .conversation(&ConversationKey::new("L2", "D"))
            .unwrap();
        assert_eq!(l2.message_count, 2);
        assert!(l2.has_pending_send);
        assert!(optimistic.active.as_ref().unwrap().messages.last().unwrap().is_pending());

        let err = controller
            .confirm_send(&payload.client_ref, Err(GatewayError::Unavailable("down".into())))
            .unwrap_err();
        assert!(matches!(err, MessagingError::Gateway(_)));

        let after = controller.current_snapshot();
        let l2 = after.conversation(&ConversationKey::new("L2", "D")).unwrap();
        assert_eq!(l2.message_count, before.message_count);
        assert_eq!(l2.last_message_id, before.last_message_id);
        assert_eq!(l2.unread_count, before.unread_count);
        assert_eq!(after.active_message_ids(), vec!["3"]);
        assert_eq!(after.failed_sends.len(), 1);
        assert_eq!(after.failed_sends[0].correlation_id, payload.client_ref);
    }

    #[test]
    fn test_retry_and_discard_failed_send() {
        let mut controller = controller();
        controller.select_conversation("L1", None);
        let payload = controller
            .stage_send("L1", "C", MessageDraft::photo("uploads/cat.jpg"))
            .unwrap();
        assert!(matches!(
            controller.retry_send(&payload.client_ref),
            Err(MessagingError::UnknownSend(_))
        ));

        controller
            .confirm_send(&payload.client_ref, Err(GatewayError::Unavailable("x".into())))
            .unwrap_err();
        let again = controller.retry_send(&payload.client_ref).unwrap();
        assert_eq!(again.client_ref, payload.client_ref);
        assert_eq!(again.kind, MessageKind::Photo);
        assert!(controller.current_snapshot().failed_sends.is_empty());

        controller
            .confirm_send(&payload.client_ref, Err(GatewayError::Unavailable("x".into())))
            .unwrap_err();
        controller.discard_failed_send(&payload.client_ref).unwrap();
        assert!(controller.pending().is_empty());
        assert!(controller.discard_failed_send(&payload.client_ref).is_err());
    }

    #[test]
    fn test_confirmation_replaces_provisional() {
        let mut controller = controller();
        controller.select_conversation("L1", None);
        let payload = controller
            .stage_send("L1", "C", MessageDraft::text("see you at 6"))
            .unwrap();

        let mut stored = payload.provisional("srv-9", 10_000);
        stored.client_ref = Some(payload.client_ref.clone());
        controller
            .confirm_send(&payload.client_ref, Ok(stored.clone()))
            .unwrap();

        let snapshot = controller.current_snapshot();
        assert_eq!(snapshot.active_message_ids(), vec!["1", "2", "srv-9"]);
        assert!(controller.pending().is_empty());

        // the same message echoed by the feed afterwards is a duplicate
        assert_eq!(controller.merge_live(stored), MergeOutcome::Duplicate);
        assert_eq!(controller.current_snapshot().active_message_ids().len(), 3);
    }

    #[test]
    fn test_feed_settles_send_before_confirmation() {
        let mut controller = controller();
        controller.select_conversation("L1", None);
        let payload = controller
            .stage_send("L1", "C", MessageDraft::location(45.76, 4.83))
            .unwrap();

        let stored = payload.provisional("srv-1", 10_000);
        controller.merge_live(stored.clone());
        assert!(controller.pending().is_empty());
        assert_eq!(controller.current_snapshot().active_message_ids(), vec!["1", "2", "srv-1"]);

        controller.confirm_send(&payload.client_ref, Ok(stored)).unwrap();
        assert_eq!(controller.current_snapshot().active_message_ids().len(), 3);
    }

    #[test]
    fn test_late_confirmation_lands_in_background_conversation() {
        let mut controller = controller();
        controller.select_conversation("L1", None);
        let payload = controller
            .stage_send("L1", "C", MessageDraft::text("on my way"))
            .unwrap();

        controller.select_conversation("L2", None);
        let stored = payload.provisional("srv-2", 10_000);
        controller.confirm_send(&payload.client_ref, Ok(stored)).unwrap();

        let snapshot = controller.current_snapshot();
        let l1 = snapshot.conversation(&l1()).unwrap();
        assert_eq!(l1.last_message_id, "srv-2");
        assert!(!l1.is_active);
        assert_eq!(controller.store().messages(&l1.key).len(), 3);
    }

    #[test]
    fn test_enrichment_replaces_placeholders() {
        let mut controller = controller();
        assert!(!controller.current_snapshot().is_settled);
        let requests = controller.take_enrichment_requests();
        assert!(requests.contains(&EnrichmentRequest::DisplayName {
            user_id: "C".to_string()
        }));
        assert!(controller.take_enrichment_requests().is_empty());

        controller.apply_enrichment(
            &EnrichmentRequest::DisplayName {
                user_id: "C".to_string(),
            },
            Ok("Camille".to_string()),
        );
        controller.apply_enrichment(
            &EnrichmentRequest::SubjectTitle {
                thread_id: "L1".to_string(),
            },
            Err(GatewayError::NotFound("L1".into())),
        );

        let snapshot = controller.current_snapshot();
        let l1 = snapshot.conversation(&l1()).unwrap();
        assert_eq!(l1.counterpart_name, "Camille");
        assert_eq!(l1.subject_title, "Listing unavailable");
    }

    #[test]
    fn test_unread_filter_keeps_global_badge() {
        let mut controller = controller();
        let batch = controller.mark_read(&["3".to_string()]).unwrap().unwrap();
        controller.apply_read_result(&batch, Ok(batch.ids.clone())).unwrap();

        controller.set_filter(ConversationFilter {
            unread_only: true,
            thread_id: None,
        });
        let snapshot = controller.current_snapshot();
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].key, l1());
        assert_eq!(snapshot.total_unread, 1);
    }

    #[test]
    fn test_live_message_binds_empty_listing_selection() {
        let mut controller = controller();
        controller.select_conversation("L5", None);
        controller.take_enrichment_requests();
        assert!(controller.active_key().is_none());

        controller.merge_live(msg("9", "L5", "X", "V", 400));
        let key = ConversationKey::new("L5", "X");
        assert_eq!(controller.active_key(), Some(key.clone()));
        assert_eq!(controller.current_snapshot().active_message_ids(), vec!["9"]);
        assert!(controller
            .take_enrichment_requests()
            .contains(&EnrichmentRequest::DisplayName {
                user_id: "X".to_string()
            }));

        let batch = controller.mark_active_read().unwrap();
        assert_eq!(batch.ids, vec!["9".to_string()]);
        assert_eq!(
            controller.prepare_send(&MessageDraft::text("where can we meet?")).unwrap(),
            SendTarget::Known {
                thread_id: "L5".to_string(),
                recipient_id: "X".to_string()
            }
        );
    }

    #[test]
    fn test_live_message_on_other_listing_leaves_selection() {
        let mut controller = controller();
        controller.select_conversation("L5", None);
        controller.merge_live(msg("9", "L6", "X", "V", 400));
        assert!(controller.active_key().is_none());
        assert_eq!(
            controller.prepare_send(&MessageDraft::text("hello")).unwrap(),
            SendTarget::NeedsContact {
                thread_id: "L5".to_string()
            }
        );
    }

    #[test]
    fn test_send_target_rechecks_store() {
        let mut controller = controller();
        controller.select_conversation("L5", None);
        // arrives without going through the live merge
        controller.confirm_send("unknown-ref", Ok(msg("9", "L5", "X", "V", 400))).unwrap();
        assert_eq!(
            controller.prepare_send(&MessageDraft::text("thanks")).unwrap(),
            SendTarget::Known {
                thread_id: "L5".to_string(),
                recipient_id: "X".to_string()
            }
        );
    }

    #[test]
    fn test_unconfirmed_read_ids_are_reported() {
        let mut controller = controller();
        let batch = controller
            .mark_read(&["2".to_string(), "3".to_string()])
            .unwrap()
            .unwrap();
        let err = controller
            .apply_read_result(&batch, Ok(vec!["3".to_string()]))
            .unwrap_err();
        assert_eq!(
            err,
            MessagingError::ReadRejected {
                ids: vec!["2".to_string()]
            }
        );
        assert!(!err.is_retryable());

        assert!(!controller.store().get("2").unwrap().is_read);
        assert!(controller.store().get("3").unwrap().is_read);
        assert_eq!(unread(&controller, &l1()), 1);
        assert_eq!(controller.current_snapshot().total_unread, 1);
    }

    #[test]
    fn test_catch_up_merges_missed_messages() {
        let mut controller = controller();
        controller.set_live_connected(true);
        controller.set_live_connected(false);
        assert!(!controller.current_snapshot().live_connected);

        let missed = controller.merge_catch_up(vec![
            msg("2", "L1", "C", "V", 200),
            msg("4", "L1", "C", "V", 300),
        ]);
        assert_eq!(missed, vec![l1()]);
        assert_eq!(unread(&controller, &l1()), 2);

        controller.set_live_connected(true);
        assert!(controller.current_snapshot().live_connected);
    }
}
