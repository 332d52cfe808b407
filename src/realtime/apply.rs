//! Decoding of change rows into engine actions.

use serde_json::Value;

use crate::core::ids::ConversationId;
use crate::core::message::ChatMessage;
use crate::persistence::rows::MessageRow;

use super::feed::{ChangeEvent, ChangeTable, RowChange};

/// What the engine should do with one change row.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedAction {
    /// Merge a message into the active conversation.
    MergeMessage(Box<ChatMessage>),
    /// The active conversation was renamed.
    RenameConversation {
        /// Conversation the rename applies to.
        id: ConversationId,
        /// New title.
        title: String,
    },
    /// The active conversation was deleted remotely.
    RemoveConversation(ConversationId),
    /// Out of scope or undecodable; nothing to do.
    Ignore,
}

/// Decode `change` into an action scoped to the `active` conversation.
///
/// Message updates are folded into the merge path; message deletes are
/// ignored because removing an already-rendered message would contradict
/// at-least-once redelivery of the same row.
#[must_use]
pub fn decode(change: &RowChange, active: Option<ConversationId>) -> FeedAction {
    match (change.table, change.event) {
        (ChangeTable::Messages, ChangeEvent::Insert | ChangeEvent::Update) => {
            let Ok(row) = serde_json::from_value::<MessageRow>(change.row.clone()) else {
                return FeedAction::Ignore;
            };
            let message = row.into_message();
            if message.conversation_id.is_some() && message.conversation_id == active {
                FeedAction::MergeMessage(Box::new(message))
            } else {
                FeedAction::Ignore
            }
        }
        (ChangeTable::Messages, ChangeEvent::Delete) => FeedAction::Ignore,
        (ChangeTable::Conversations, ChangeEvent::Update) => {
            match (row_conversation_id(&change.row), row_title(&change.row)) {
                (Some(id), Some(title)) if active == Some(id) => {
                    FeedAction::RenameConversation { id, title }
                }
                _ => FeedAction::Ignore,
            }
        }
        (ChangeTable::Conversations, ChangeEvent::Delete) => {
            match row_conversation_id(&change.row) {
                Some(id) if active == Some(id) => FeedAction::RemoveConversation(id),
                _ => FeedAction::Ignore,
            }
        }
        (ChangeTable::Conversations, ChangeEvent::Insert) => FeedAction::Ignore,
    }
}

fn row_conversation_id(row: &Value) -> Option<ConversationId> {
    row.get("id")?.as_str()?.parse().ok()
}

fn row_title(row: &Value) -> Option<String> {
    Some(row.get("title")?.as_str()?.to_string())
}
