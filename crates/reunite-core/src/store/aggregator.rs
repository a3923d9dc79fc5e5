//! Conversation derivation.
//!
//! Folds a viewer's messages into one `Conversation` per `(thread_id, counterpart_id)`.
//! Pure: no I/O, no display lookups. Names and titles are layered on later by the
//! snapshot builder so a failed lookup can never hide a conversation.

use crate::models::{Conversation, ConversationKey, Message};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Aggregate using each message's own `is_read` flag.
pub fn aggregate<'a, I>(messages: I, viewer: &str) -> Vec<Conversation>
where
    I: IntoIterator<Item = &'a Message>,
{
    aggregate_conversations(messages, viewer, |m| m.is_read)
}

/// Aggregate with a caller-supplied read predicate, so optimistic marks that
/// have not been confirmed yet can be counted as read.
///
/// Messages without a thread, messages the viewer does not take part in, and
/// repeated ids are skipped. The result is sorted newest conversation first.
pub fn aggregate_conversations<'a, I, F>(messages: I, viewer: &str, is_read: F) -> Vec<Conversation>
where
    I: IntoIterator<Item = &'a Message>,
    F: Fn(&Message) -> bool,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut groups: HashMap<ConversationKey, Conversation> = HashMap::new();

    for message in messages {
        let Some(key) = ConversationKey::for_message(message, viewer) else {
            continue;
        };
        if !seen.insert(message.id.as_str()) {
            continue;
        }

        let unread = message.is_addressed_to(viewer) && !is_read(message);

        match groups.get_mut(&key) {
            Some(conversation) => {
                conversation.message_count += 1;
                if unread {
                    conversation.unread_count += 1;
                }
                if message.order_key() > conversation.last_message.order_key() {
                    conversation.last_message = message.clone();
                }
            }
            None => {
                groups.insert(
                    key.clone(),
                    Conversation {
                        key,
                        last_message: message.clone(),
                        unread_count: usize::from(unread),
                        message_count: 1,
                    },
                );
            }
        }
    }

    let mut conversations: Vec<Conversation> = groups.into_values().collect();
    sort_conversations(&mut conversations);
    conversations
}

/// Newest `last_message` first. Ties fall back to message id, then key, so the
/// order is fully deterministic across recomputations.
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| compare_recency(b, a));
}

fn compare_recency(a: &Conversation, b: &Conversation) -> Ordering {
    a.last_message
        .order_key()
        .cmp(&b.last_message.order_key())
        .then_with(|| b.key.cmp(&a.key))
}

/// Sum of unread counts, for the global badge.
pub fn total_unread(conversations: &[Conversation]) -> usize {
    conversations.iter().map(|c| c.unread_count).sum()
}
