use std::time::Duration;

use anyhow::{Context, Result};
use reunite_core::models::{ConversationFilter, MessageDraft};
use reunite_core::session::SessionSnapshot;
use reunite_core::SessionHandle;
use serde_json::{json, Value};

/// One-shot command run against a session
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Conversation list with unread counts
    Conversations {
        unread_only: bool,
        thread_id: Option<String>,
    },
    /// Open a conversation (marks its messages read)
    Thread {
        thread_id: String,
        counterpart_id: Option<String>,
    },
    /// Open a conversation and send to it
    Send {
        thread_id: String,
        counterpart_id: Option<String>,
        draft: MessageDraft,
    },
    MarkRead { ids: Vec<String> },
}

/// Run `command` and return the JSON to print.
///
/// Waits up to `settle_timeout` for in-flight writes and lookups so the output
/// shows resolved names and confirmed read flags.
pub async fn execute(
    handle: &SessionHandle,
    command: CliCommand,
    settle_timeout: Duration,
) -> Result<Value> {
    match command {
        CliCommand::Conversations {
            unread_only,
            thread_id,
        } => {
            handle
                .set_filter(ConversationFilter {
                    unread_only,
                    thread_id,
                })
                .await?;
            let snapshot = settle(handle, settle_timeout).await;
            Ok(conversations_json(&snapshot))
        }
        CliCommand::Thread {
            thread_id,
            counterpart_id,
        } => {
            handle.select(thread_id, counterpart_id).await?;
            let snapshot = settle(handle, settle_timeout).await;
            Ok(json!({ "thread": snapshot.active }))
        }
        CliCommand::Send {
            thread_id,
            counterpart_id,
            draft,
        } => {
            handle.select(thread_id.clone(), counterpart_id).await?;
            let message = handle
                .send(draft)
                .await
                .with_context(|| format!("Failed to send to {}", thread_id))?;
            let snapshot = settle(handle, settle_timeout).await;
            Ok(json!({ "message": message, "thread": snapshot.active }))
        }
        CliCommand::MarkRead { ids } => {
            handle.mark_read(ids).await?;
            let snapshot = settle(handle, settle_timeout).await;
            Ok(conversations_json(&snapshot))
        }
    }
}

async fn settle(handle: &SessionHandle, timeout: Duration) -> std::sync::Arc<SessionSnapshot> {
    match tokio::time::timeout(timeout, handle.wait_until(|s| s.is_settled)).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            tracing::warn!("session ended before settling: {}", e);
            handle.snapshot()
        }
        Err(_) => {
            tracing::warn!(?timeout, "session did not settle, printing current state");
            handle.snapshot()
        }
    }
}

fn conversations_json(snapshot: &SessionSnapshot) -> Value {
    json!({
        "viewer": snapshot.viewer,
        "totalUnread": snapshot.total_unread,
        "conversations": snapshot.conversations,
    })
}
