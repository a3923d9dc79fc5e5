pub mod controller;
pub mod live_feed;
pub mod pending;
pub mod runtime;
pub mod snapshot;

pub use controller::{ConversationController, Selection, SendTarget};
pub use live_feed::LiveFeed;
pub use pending::{PendingSend, PendingSends, PendingStatus};
pub use runtime::{SessionCommand, SessionHandle, SessionRuntime};
pub use snapshot::{ActiveThread, ConversationSummary, FailedSend, SessionSnapshot, SnapshotPublisher};
