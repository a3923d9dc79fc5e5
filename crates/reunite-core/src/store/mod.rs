pub mod aggregator;
pub mod enrichment;
pub mod message_store;
pub mod unread;

pub use aggregator::{aggregate, aggregate_conversations, sort_conversations, total_unread};
pub use enrichment::{EnrichmentCache, EnrichmentRequest};
pub use message_store::{MergeOutcome, MessageStore};
pub use unread::{ReadBatch, UnreadLedger};
