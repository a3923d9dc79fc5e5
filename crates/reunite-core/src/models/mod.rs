pub mod conversation;
pub mod enriched;
pub mod message;

pub use conversation::{Conversation, ConversationFilter, ConversationKey};
pub use enriched::{DeliveryState, EnrichedMessage};
pub use message::{Location, Message, MessageDraft, MessageKind, NewMessage};
