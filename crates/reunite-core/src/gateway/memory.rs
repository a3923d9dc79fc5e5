//! In-process implementations of the gateway contracts.
//!
//! Used by the CLI and by tests. Both carry fault injection so the session's
//! failure paths (outages, duplicate deliveries, slow writes) can be driven
//! deterministically.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use super::{Directory, InsertFilter, MessageFilter, MessageGateway, MessageStream};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{Message, NewMessage};

const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct StoreState {
    messages: Vec<Message>,
    last_created_at: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub inserts: usize,
    pub queries: usize,
    pub read_updates: usize,
    pub subscriptions: usize,
}

#[derive(Default)]
struct Faults {
    failing_inserts: u32,
    failing_read_updates: u32,
    failing_queries: u32,
    failing_subscriptions: u32,
}

pub struct InMemoryGateway {
    state: Mutex<StoreState>,
    faults: Mutex<Faults>,
    calls: Mutex<CallCounts>,
    feed: broadcast::Sender<Message>,
    /// Bumped to cut every open subscription
    feed_generation: watch::Sender<u64>,
    inserts_paused: watch::Sender<bool>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::with_feed_capacity(FEED_CAPACITY)
    }

    /// Subscribers further behind than `capacity` messages are cut off.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        let (feed_generation, _) = watch::channel(0);
        let (inserts_paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(StoreState::default()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(CallCounts::default()),
            feed,
            feed_generation,
            inserts_paused,
        }
    }

    /// Preload stored messages without publishing them on the feed.
    pub fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state.lock();
        for message in messages {
            state.last_created_at = state.last_created_at.max(message.created_at);
            state.messages.push(message);
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.state.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// Delete a stored message, as moderation would. Open sessions are not told.
    pub fn remove(&self, id: &str) -> Option<Message> {
        let mut state = self.state.lock();
        let index = state.messages.iter().position(|m| m.id == id)?;
        Some(state.messages.remove(index))
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    // ===== Fault injection =====

    pub fn fail_next_inserts(&self, count: u32) {
        self.faults.lock().failing_inserts = count;
    }

    pub fn fail_next_read_updates(&self, count: u32) {
        self.faults.lock().failing_read_updates = count;
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.faults.lock().failing_queries = count;
    }

    /// Inserts block (after being counted) until `resume_inserts`.
    pub fn pause_inserts(&self) {
        self.inserts_paused.send_replace(true);
    }

    pub fn resume_inserts(&self) {
        self.inserts_paused.send_replace(false);
    }

    /// Drop every open subscription, as a lost connection would. Each stream
    /// yields `SubscriptionClosed` once and ends; new subscriptions work normally.
    pub fn disconnect_feeds(&self) {
        self.feed_generation.send_modify(|generation| *generation += 1);
    }

    pub fn fail_next_subscriptions(&self, count: u32) {
        self.faults.lock().failing_subscriptions = count;
    }

    /// Publish a stored message on the feed again, as an at-least-once transport may.
    pub fn redeliver(&self, id: &str) -> bool {
        match self.get(id) {
            Some(message) => {
                let _ = self.feed.send(message);
                true
            }
            None => false,
        }
    }

    /// Insert on behalf of another user, published on the feed like a real send.
    pub fn deliver(&self, payload: NewMessage) -> Message {
        let message = self.store(payload);
        let _ = self.feed.send(message.clone());
        message
    }

    fn store(&self, payload: NewMessage) -> Message {
        let mut state = self.state.lock();
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let created_at = now.max(state.last_created_at + 1);
        state.last_created_at = created_at;

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: Some(payload.thread_id),
            sender_id: payload.sender_id,
            recipient_id: payload.recipient_id,
            content: payload.content,
            photo_ref: payload.photo_ref,
            location: payload.location,
            kind: payload.kind,
            created_at,
            is_read: false,
            client_ref: Some(payload.client_ref),
        };
        state.messages.push(message.clone());
        message
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageGateway for InMemoryGateway {
    async fn insert_message(&self, payload: NewMessage) -> GatewayResult<Message> {
        self.calls.lock().inserts += 1;

        let mut paused = self.inserts_paused.subscribe();
        let resumed = paused.wait_for(|p| !*p).await.is_ok();
        if !resumed {
            return Err(GatewayError::Unavailable("store shut down".into()));
        }

        if Self::take_fault(&mut self.faults.lock().failing_inserts) {
            return Err(GatewayError::Unavailable("insert failed".into()));
        }
        Ok(self.deliver(payload))
    }

    async fn query_messages(&self, filter: MessageFilter) -> GatewayResult<Vec<Message>> {
        self.calls.lock().queries += 1;
        if Self::take_fault(&mut self.faults.lock().failing_queries) {
            return Err(GatewayError::Unavailable("query failed".into()));
        }
        Ok(self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn update_read_flag(
        &self,
        ids: Vec<String>,
        recipient_id: String,
    ) -> GatewayResult<Vec<String>> {
        self.calls.lock().read_updates += 1;
        if Self::take_fault(&mut self.faults.lock().failing_read_updates) {
            return Err(GatewayError::Unavailable("read update failed".into()));
        }

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut state = self.state.lock();
        let mut now_read = Vec::new();
        for message in state.messages.iter_mut() {
            if wanted.contains(message.id.as_str()) && message.recipient_id == recipient_id {
                message.is_read = true;
                now_read.push(message.id.clone());
            }
        }
        Ok(now_read)
    }

    async fn subscribe_to_inserts(&self, filter: InsertFilter) -> GatewayResult<MessageStream> {
        self.calls.lock().subscriptions += 1;
        if Self::take_fault(&mut self.faults.lock().failing_subscriptions) {
            return Err(GatewayError::Unavailable("subscribe failed".into()));
        }
        let feed = FeedState {
            rx: self.feed.subscribe(),
            cut: self.feed_generation.subscribe(),
            filter,
            closed: false,
        };

        let stream = stream::unfold(feed, |mut feed| async move {
            if feed.closed {
                return None;
            }
            loop {
                tokio::select! {
                    biased;
                    changed = feed.cut.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                        feed.closed = true;
                        return Some((Err(GatewayError::SubscriptionClosed), feed));
                    }
                    received = feed.rx.recv() => match received {
                        Ok(message) if feed.filter.matches(&message) => {
                            return Some((Ok(message), feed));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // missed inserts cannot be replayed from here
                            tracing::warn!(skipped, "insert feed lagged, closing subscription");
                            feed.closed = true;
                            return Some((Err(GatewayError::SubscriptionClosed), feed));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct FeedState {
    rx: broadcast::Receiver<Message>,
    cut: watch::Receiver<u64>,
    filter: InsertFilter,
    closed: bool,
}

#[derive(Default)]
struct DirectoryState {
    names: HashMap<String, String>,
    titles: HashMap<String, String>,
    contacts: HashMap<String, String>,
    unavailable_users: HashSet<String>,
    unavailable_threads: HashSet<String>,
}

/// Directory backed by plain maps. Unknown ids resolve to `NotFound`, ids marked
/// unavailable fail transiently until cleared.
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
        }
    }

    pub fn add_user(&self, user_id: impl Into<String>, display_name: impl Into<String>) {
        self.state
            .lock()
            .names
            .insert(user_id.into(), display_name.into());
    }

    /// Register a listing with its title and the user who receives first messages.
    pub fn add_listing(
        &self,
        thread_id: impl Into<String>,
        title: impl Into<String>,
        contact_id: impl Into<String>,
    ) {
        let thread_id = thread_id.into();
        let mut state = self.state.lock();
        state.titles.insert(thread_id.clone(), title.into());
        state.contacts.insert(thread_id, contact_id.into());
    }

    pub fn remove_listing(&self, thread_id: &str) {
        let mut state = self.state.lock();
        state.titles.remove(thread_id);
        state.contacts.remove(thread_id);
    }

    pub fn set_user_unavailable(&self, user_id: &str, unavailable: bool) {
        let mut state = self.state.lock();
        if unavailable {
            state.unavailable_users.insert(user_id.to_string());
        } else {
            state.unavailable_users.remove(user_id);
        }
    }

    pub fn set_thread_unavailable(&self, thread_id: &str, unavailable: bool) {
        let mut state = self.state.lock();
        if unavailable {
            state.unavailable_threads.insert(thread_id.to_string());
        } else {
            state.unavailable_threads.remove(thread_id);
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve_display_identity(&self, user_id: &str) -> GatewayResult<String> {
        let state = self.state.lock();
        if state.unavailable_users.contains(user_id) {
            return Err(GatewayError::Unavailable(format!("directory: {}", user_id)));
        }
        state
            .names
            .get(user_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(user_id.to_string()))
    }

    async fn resolve_subject_title(&self, thread_id: &str) -> GatewayResult<String> {
        let state = self.state.lock();
        if state.unavailable_threads.contains(thread_id) {
            return Err(GatewayError::Unavailable(format!("directory: {}", thread_id)));
        }
        state
            .titles
            .get(thread_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(thread_id.to_string()))
    }

    async fn resolve_subject_contact(&self, thread_id: &str) -> GatewayResult<String> {
        let state = self.state.lock();
        if state.unavailable_threads.contains(thread_id) {
            return Err(GatewayError::Unavailable(format!("directory: {}", thread_id)));
        }
        state
            .contacts
            .get(thread_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(thread_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageDraft, MessageKind};

    fn payload(from: &str, to: &str, content: &str) -> NewMessage {
        NewMessage::from_draft("L1", from, to, &MessageDraft::text(content), "ref-1").unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_increasing_timestamps() {
        let gateway = InMemoryGateway::new();
        let a = gateway.insert_message(payload("a", "b", "one")).await.unwrap();
        let b = gateway.insert_message(payload("a", "b", "two")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(b.created_at > a.created_at);
        assert_eq!(a.kind, MessageKind::Text);
        assert_eq!(a.client_ref.as_deref(), Some("ref-1"));
    }

    #[tokio::test]
    async fn test_query_filters_by_participant_and_thread() {
        let gateway = InMemoryGateway::new();
        gateway.insert_message(payload("a", "b", "x")).await.unwrap();
        gateway.insert_message(payload("c", "d", "y")).await.unwrap();

        let for_b = gateway
            .query_messages(MessageFilter::participant("b"))
            .await
            .unwrap();
        assert_eq!(for_b.len(), 1);

        let other_thread = gateway
            .query_messages(MessageFilter::participant("b").in_thread("L2"))
            .await
            .unwrap();
        assert!(other_thread.is_empty());
    }

    #[tokio::test]
    async fn test_read_update_is_conditional_on_recipient() {
        let gateway = InMemoryGateway::new();
        let m = gateway.insert_message(payload("a", "b", "x")).await.unwrap();

        let by_sender = gateway
            .update_read_flag(vec![m.id.clone()], "a".to_string())
            .await
            .unwrap();
        assert!(by_sender.is_empty());

        let by_recipient = gateway
            .update_read_flag(vec![m.id.clone()], "b".to_string())
            .await
            .unwrap();
        assert_eq!(by_recipient, vec![m.id.clone()]);

        // already read still counts as read for the caller
        let again = gateway
            .update_read_flag(vec![m.id.clone(), "missing".to_string()], "b".to_string())
            .await
            .unwrap();
        assert_eq!(again, vec![m.id]);
    }

    #[tokio::test]
    async fn test_subscription_filters_and_redelivers() {
        let gateway = InMemoryGateway::new();
        let mut to_b = gateway
            .subscribe_to_inserts(InsertFilter::Recipient("b".into()))
            .await
            .unwrap();

        gateway.insert_message(payload("x", "y", "skip")).await.unwrap();
        let m = gateway.insert_message(payload("a", "b", "hit")).await.unwrap();
        assert_eq!(to_b.next().await.unwrap().unwrap().id, m.id);

        assert!(gateway.redeliver(&m.id));
        assert_eq!(to_b.next().await.unwrap().unwrap().id, m.id);
    }

    #[tokio::test]
    async fn test_disconnect_closes_open_subscriptions() {
        let gateway = InMemoryGateway::new();
        let mut before = gateway
            .subscribe_to_inserts(InsertFilter::Recipient("b".into()))
            .await
            .unwrap();

        gateway.disconnect_feeds();
        gateway.deliver(payload("a", "b", "during the outage"));
        assert_eq!(
            before.next().await.unwrap().unwrap_err(),
            GatewayError::SubscriptionClosed
        );
        assert!(before.next().await.is_none());

        let mut after = gateway
            .subscribe_to_inserts(InsertFilter::Recipient("b".into()))
            .await
            .unwrap();
        let m = gateway.deliver(payload("a", "b", "back"));
        assert_eq!(after.next().await.unwrap().unwrap().id, m.id);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_closed_not_skipped() {
        let gateway = InMemoryGateway::with_feed_capacity(2);
        let mut to_b = gateway
            .subscribe_to_inserts(InsertFilter::Recipient("b".into()))
            .await
            .unwrap();
        for i in 0..4 {
            gateway.deliver(payload("a", "b", &format!("burst {}", i)));
        }

        assert_eq!(
            to_b.next().await.unwrap().unwrap_err(),
            GatewayError::SubscriptionClosed
        );
        assert!(to_b.next().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_insert_failure() {
        let gateway = InMemoryGateway::new();
        gateway.fail_next_inserts(1);
        assert!(gateway.insert_message(payload("a", "b", "x")).await.is_err());
        assert!(gateway.insert_message(payload("a", "b", "x")).await.is_ok());
        assert_eq!(gateway.calls().inserts, 2);
        assert_eq!(gateway.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_failures() {
        let directory = InMemoryDirectory::new();
        directory.add_user("u1", "Marie");
        directory.add_listing("L1", "Lost cat near the river", "u1");

        assert_eq!(directory.resolve_display_identity("u1").await.unwrap(), "Marie");
        assert_eq!(directory.resolve_subject_contact("L1").await.unwrap(), "u1");
        assert!(matches!(
            directory.resolve_subject_title("gone").await,
            Err(GatewayError::NotFound(_))
        ));

        directory.set_user_unavailable("u1", true);
        let err = directory.resolve_display_identity("u1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
