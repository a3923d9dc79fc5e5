/// Failures reported by the durable store or the directory service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl GatewayError {
    /// Network or store outages; the operation can be retried as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable(_) | GatewayError::SubscriptionClosed
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced to callers of the session API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("Message has no content, photo or location")]
    EmptyMessage,

    #[error("No conversation selected")]
    NoActiveConversation,

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown pending send: {0}")]
    UnknownSend(String),

    /// The store answered but left these ids unread
    #[error("Store did not mark messages read: {}", .ids.join(", "))]
    ReadRejected { ids: Vec<String> },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Session closed")]
    SessionClosed,
}

impl MessagingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            MessagingError::Gateway(e) => e.is_transient(),
            _ => false,
        }
    }
}
