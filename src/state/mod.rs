//! Client-side conversation state:
//! - ordered, identity-deduplicated message list
//! - pending bookkeeping for optimistic sends

pub mod conversation;
pub mod pending;

pub use conversation::{ConversationState, MergeOutcome};
pub use pending::{PendingEntry, PendingStore};
