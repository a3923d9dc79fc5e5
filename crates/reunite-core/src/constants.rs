//! Application-wide constants
//!
//! Defaults used when no config file overrides them.

/// Shown when a user's display identity cannot be resolved
pub const UNKNOWN_USER_LABEL: &str = "Unknown user";

/// Shown when a listing was deleted or its title cannot be fetched
pub const MISSING_SUBJECT_LABEL: &str = "Listing unavailable";

/// Conversation list preview length in characters
pub const DEFAULT_PREVIEW_CHARS: usize = 80;

/// Interval between enrichment retry passes
pub const ENRICHMENT_RETRY_INTERVAL_MS: u64 = 5_000;

/// Lookups are abandoned (placeholder kept) after this many failures
pub const ENRICHMENT_MAX_ATTEMPTS: u32 = 5;

/// Buffer size of the gateway completion channel
pub const COMPLETION_CHANNEL_SIZE: usize = 256;

/// Id prefix for optimistic messages that have not been stored yet
pub const PENDING_ID_PREFIX: &str = "pending:";

/// Environment variables read by tracing setup
pub mod env {
    pub const LOG_FILTER: &str = "REUNITE_LOG";
    pub const LOG_FILE: &str = "REUNITE_LOG_FILE";
}
