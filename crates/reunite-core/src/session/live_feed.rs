use futures::stream::{self, StreamExt};

use crate::error::GatewayResult;
use crate::gateway::{InsertFilter, MessageGateway, MessageStream};
use crate::models::Message;

/// Both insert subscriptions of a viewer (as sender and as recipient) merged into
/// one stream. A message the viewer sends to themselves arrives twice; the store
/// drops the second copy.
pub struct LiveFeed {
    inner: MessageStream,
}

impl LiveFeed {
    pub async fn open(gateway: &dyn MessageGateway, viewer: &str) -> GatewayResult<Self> {
        let sent = gateway
            .subscribe_to_inserts(InsertFilter::Sender(viewer.to_string()))
            .await?;
        let received = gateway
            .subscribe_to_inserts(InsertFilter::Recipient(viewer.to_string()))
            .await?;
        tracing::debug!(viewer, "live feed open");
        Ok(Self {
            inner: stream::select(sent, received).boxed(),
        })
    }

    /// `None` once both subscriptions have closed. An `Err` means inserts may have
    /// been missed: drop this feed, open a new one and query to catch up.
    pub async fn next(&mut self) -> Option<GatewayResult<Message>> {
        self.inner.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::InMemoryGateway;
    use crate::models::{MessageDraft, NewMessage};
    use std::time::Duration;

    fn payload(from: &str, to: &str, text: &str) -> NewMessage {
        NewMessage::from_draft("L1", from, to, &MessageDraft::text(text), "ref").unwrap()
    }

    #[tokio::test]
    async fn test_feed_carries_both_directions() {
        let gateway = InMemoryGateway::new();
        let mut feed = LiveFeed::open(&gateway, "V").await.unwrap();

        gateway.deliver(payload("C", "V", "found it"));
        gateway.insert_message(payload("V", "C", "thanks!")).await.unwrap();
        gateway.deliver(payload("C", "D", "not for V"));

        let first = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let mut contents = vec![first.content, second.content];
        contents.sort();
        assert_eq!(contents, vec!["found it", "thanks!"]);

        assert!(
            tokio::time::timeout(Duration::from_millis(50), feed.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_disconnect_surfaces_as_error() {
        let gateway = InMemoryGateway::new();
        let mut feed = LiveFeed::open(&gateway, "V").await.unwrap();

        gateway.disconnect_feeds();
        let item = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.unwrap_err(), GatewayError::SubscriptionClosed);
    }
}
